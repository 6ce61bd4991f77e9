//! Shared test fixtures: an in-memory, schema-aware command runner.
//!
//! The mock honors the runner contract: batches run in one transaction (a
//! working copy committed only when every item succeeds), identity links are
//! filled from earlier items' returned values, and a failed concurrency
//! guard surfaces as a driver error whose message is the guard's tag.

use relmodel::{
    AutoValueKind, CommandRunner, Cx, DriverError, EntityInfo, Error, ItemOutcome, KeyLookup,
    MutationOp, Outcome, ReferenceProbe, Schema, SubmitBatch, SubmitOutcome, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Row = HashMap<String, Value>;

#[derive(Default)]
pub struct MockState {
    pub tables: HashMap<String, Vec<Row>>,
    pub next_ids: HashMap<String, i32>,
    /// Fail the batch when it reaches this item index.
    pub fail_on_item: Option<usize>,
    pub submit_calls: usize,
    pub fetch_calls: usize,
}

pub struct MockRunner {
    schema: Arc<Schema>,
    pub state: Arc<Mutex<MockState>>,
}

impl MockRunner {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// A second runner over the same backing store, for multi-session tests.
    pub fn share(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            state: Arc::clone(&self.state),
        }
    }

    /// Insert a row directly into the backing store.
    pub fn seed(&self, table: &str, pairs: &[(&str, Value)]) {
        let row: Row = pairs
            .iter()
            .map(|(c, v)| ((*c).to_string(), v.clone()))
            .collect();
        let mut state = self.state.lock().expect("mock state poisoned");
        state.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .expect("mock state poisoned")
            .tables
            .get(table)
            .map_or(0, Vec::len)
    }

    fn info(&self, entity: &str) -> &EntityInfo {
        self.schema.entity_by_name(entity).expect("known entity")
    }

    fn identity_column(info: &EntityInfo) -> Option<String> {
        info.columns()
            .find(|(_, _, c)| c.auto == AutoValueKind::Identity && !c.foreign_key)
            .map(|(_, m, _)| m.name.clone())
    }

    fn row_version_column(info: &EntityInfo) -> Option<String> {
        info.row_version_member()
            .map(|mi| info.members[mi].name.clone())
    }
}

fn row_matches(row: &Row, columns: &[String], values: &[Value]) -> bool {
    columns
        .iter()
        .zip(values)
        .all(|(c, v)| row.get(c) == Some(v))
}

impl CommandRunner for MockRunner {
    async fn fetch_by_key(
        &self,
        _cx: &Cx,
        lookup: &KeyLookup,
    ) -> Outcome<Option<Vec<Value>>, Error> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.fetch_calls += 1;
        let row = state.tables.get(&lookup.table).and_then(|rows| {
            rows.iter()
                .find(|row| row_matches(row, &lookup.key_columns, &lookup.key_values))
        });
        Outcome::Ok(row.map(|row| {
            lookup
                .select_columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        }))
    }

    async fn submit(&self, _cx: &Cx, batch: &SubmitBatch) -> Outcome<SubmitOutcome, Error> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.submit_calls += 1;

        // Transaction: mutate a working copy, commit only on full success.
        let mut tables = state.tables.clone();
        let mut next_ids = state.next_ids.clone();
        let mut results: Vec<ItemOutcome> = Vec::new();

        for (i, item) in batch.items.iter().enumerate() {
            if state.fail_on_item == Some(i) {
                return Outcome::Err(Error::Driver(DriverError::message(
                    "backend unavailable",
                )));
            }

            let info = self.info(&item.entity);
            let mut set: Row = item
                .set_columns
                .iter()
                .cloned()
                .zip(item.set_values.iter().cloned())
                .collect();

            for link in &item.identity_links {
                let src = &batch.items[link.source_item];
                let src_info = self.info(&src.entity);
                let id_col =
                    Self::identity_column(src_info).expect("identity link source has identity");
                let value = results[link.source_item]
                    .returned
                    .iter()
                    .find(|(c, _)| *c == id_col)
                    .map(|(_, v)| v.clone())
                    .expect("identity value returned by earlier item");
                set.insert(link.column.clone(), value);
            }

            match item.op {
                MutationOp::Insert => {
                    let mut returned = Vec::new();
                    if let Some(id_col) = Self::identity_column(info) {
                        let next = next_ids.entry(item.table.clone()).or_insert(1);
                        let id = Value::Int(*next);
                        *next += 1;
                        set.insert(id_col.clone(), id.clone());
                        returned.push((id_col, id));
                    }
                    if let Some(rv_col) = Self::row_version_column(info) {
                        set.insert(rv_col.clone(), Value::BigInt(1));
                        returned.push((rv_col, Value::BigInt(1)));
                    }
                    tables.entry(item.table.clone()).or_default().push(set);
                    results.push(ItemOutcome {
                        affected: 1,
                        returned,
                    });
                }
                MutationOp::Update => {
                    let rows = tables.entry(item.table.clone()).or_default();
                    let found = rows
                        .iter_mut()
                        .find(|row| row_matches(row, &item.where_columns, &item.where_values));
                    match found {
                        Some(row) => {
                            for (c, v) in set {
                                row.insert(c, v);
                            }
                            let mut returned = Vec::new();
                            if let Some(rv_col) = Self::row_version_column(info) {
                                let next =
                                    row.get(&rv_col).and_then(Value::as_i64).unwrap_or(0) + 1;
                                row.insert(rv_col.clone(), Value::BigInt(next));
                                returned.push((rv_col, Value::BigInt(next)));
                            }
                            results.push(ItemOutcome {
                                affected: 1,
                                returned,
                            });
                        }
                        None => {
                            if let Some(guard) = &item.concurrency {
                                return Outcome::Err(Error::Driver(DriverError::message(
                                    guard.tag.clone(),
                                )));
                            }
                            results.push(ItemOutcome::default());
                        }
                    }
                }
                MutationOp::Delete => {
                    let rows = tables.entry(item.table.clone()).or_default();
                    let before = rows.len();
                    rows.retain(|row| !row_matches(row, &item.where_columns, &item.where_values));
                    let affected = (before - rows.len()) as u64;
                    if affected == 0 {
                        if let Some(guard) = &item.concurrency {
                            return Outcome::Err(Error::Driver(DriverError::message(
                                guard.tag.clone(),
                            )));
                        }
                    }
                    results.push(ItemOutcome {
                        affected,
                        returned: Vec::new(),
                    });
                }
            }
        }

        state.tables = tables;
        state.next_ids = next_ids;
        Outcome::Ok(SubmitOutcome { items: results })
    }

    async fn reference_exists(&self, _cx: &Cx, probe: &ReferenceProbe) -> Outcome<bool, Error> {
        let state = self.state.lock().expect("mock state poisoned");
        let exists = state.tables.get(&probe.table).is_some_and(|rows| {
            rows.iter()
                .any(|row| row_matches(row, &probe.fk_columns, &probe.key_values))
        });
        Outcome::Ok(exists)
    }
}

/// Unwrap an [`Outcome`], panicking on anything but `Ok`.
pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("operation failed: {e}"),
        Outcome::Cancelled(_) => panic!("operation cancelled"),
        Outcome::Panicked(_) => panic!("operation panicked"),
    }
}
