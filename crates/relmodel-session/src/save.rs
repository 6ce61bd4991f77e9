//! The save pipeline: before-save fixpoint, batched validation,
//! dependency-ordered submission, all-or-nothing commit.
//!
//! Ordering inside one `save_changes` call:
//!
//! 1. before-save hooks run over the changed set in stable order, to a
//!    bounded fixpoint — records spawned by hooks are processed in later
//!    rounds only;
//! 2. validation collects every fault across every changed record before
//!    failing;
//! 3. the batch is built deletes child-first, inserts parent-first (by
//!    foreign-key depth), updates last, and handed to the runner as one
//!    transaction;
//! 4. on success: returned values applied, after-save hooks, commit, clear;
//! 5. on failure: abort hooks in reverse order, transient records dropped
//!    from both working sets, the error classified before re-throw. Nothing
//!    is committed; originals survive for a retry.

use crate::record::{EntityRecord, RecordRef, RecordStatus};
use crate::{HookContext, Session};
use asupersync::{Cx, Outcome};
use relmodel_core::{
    AutoValueKind, CommandRunner, ConcurrencyGuard, Error, IdentityLink, MutationOp, Result,
    SubmitBatch, SubmitItem, SubmitOutcome, ValidationFaults, Value, concurrency_tag,
};
use relmodel_schema::{EntityInfo, EntityKey, Schema};
use std::collections::HashMap;
use std::sync::Arc;

/// Bound on before-save fixpoint rounds; hooks still adding records after
/// this many sweeps fail the save.
const MAX_SAVING_ROUNDS: usize = 10;

impl<R: CommandRunner> Session<R> {
    /// Persist the unit of work.
    ///
    /// Either every change becomes visible or none does. A failed save
    /// leaves the in-memory record set untouched (minus transient records),
    /// so the same unit of work can be retried after the caller resolves
    /// the reported conflict.
    #[tracing::instrument(level = "info", skip_all, fields(session = self.id))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_writable() {
            return Outcome::Err(e);
        }
        if let Err(e) = self.run_saving_hooks() {
            return Outcome::Err(e);
        }
        if self.options.validate_on_save {
            if let Err(e) = self.validate_changes() {
                return Outcome::Err(e);
            }
        }

        let live: Vec<RecordRef> = self
            .changed_records()
            .into_iter()
            .filter(|r| r.read().expect("record lock poisoned").status().is_changed())
            .collect();
        if live.is_empty() {
            return Outcome::Ok(());
        }

        let (ordered, batch) = match self.build_batch(&live) {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        };
        tracing::info!(
            deletes = batch.count(MutationOp::Delete),
            inserts = batch.count(MutationOp::Insert),
            updates = batch.count(MutationOp::Update),
            "submitting unit of work"
        );

        match self.runner.submit(cx, &batch).await {
            Outcome::Ok(outcome) => {
                if outcome.items.len() != batch.items.len() {
                    self.abort_save();
                    return Outcome::Err(Error::Custom(format!(
                        "runner returned {} results for {} items",
                        outcome.items.len(),
                        batch.items.len()
                    )));
                }
                match self.commit_after_submit(&ordered, &batch, &outcome) {
                    Ok(()) => Outcome::Ok(()),
                    Err(e) => Outcome::Err(e),
                }
            }
            Outcome::Err(e) => {
                self.abort_save();
                Outcome::Err(self.classify_error(e))
            }
            Outcome::Cancelled(r) => {
                self.abort_save();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.abort_save();
                Outcome::Panicked(p)
            }
        }
    }

    /// Before-save fixpoint: auto values plus per-entity `on_saving` hooks,
    /// re-run over hook-spawned records until no new records appear.
    pub(crate) fn run_saving_hooks(&self) -> Result<()> {
        let now = self.clock.now_micros();
        let mut processed = 0usize;

        for round in 0..MAX_SAVING_ROUNDS {
            let snapshot = self.changed_records();
            if processed >= snapshot.len() {
                return Ok(());
            }
            tracing::debug!(round, new_records = snapshot.len() - processed, "save hook sweep");

            for rec in &snapshot[processed..] {
                let (status, entity_name) = {
                    let guard = rec.read().expect("record lock poisoned");
                    (
                        guard.status(),
                        self.schema.entity(guard.entity()).name.clone(),
                    )
                };
                if !status.is_changed() {
                    continue;
                }

                apply_auto_values(
                    &self.schema,
                    &mut rec.write().expect("record lock poisoned"),
                    now,
                );

                if let Some(hook) = self.hooks.saving(&entity_name) {
                    let mut ctx = HookContext::new(&self.schema, now);
                    hook(&mut rec.write().expect("record lock poisoned"), &mut ctx)?;
                    for spawned in ctx.take_spawned() {
                        self.attach(spawned)?;
                    }
                }
            }
            processed = snapshot.len();
        }

        if processed < self.changed_records().len() {
            return Err(Error::Custom(format!(
                "before-save hooks kept adding records after {MAX_SAVING_ROUNDS} rounds"
            )));
        }
        Ok(())
    }

    /// Validate every changed record, collecting all faults before failing.
    pub(crate) fn validate_changes(&self) -> Result<()> {
        let mut faults = ValidationFaults::new();

        for rec in self.changed_records() {
            let mut guard = rec.write().expect("record lock poisoned");
            if !matches!(guard.status(), RecordStatus::New | RecordStatus::Modified) {
                continue;
            }
            let info = self.schema.entity(guard.entity());
            let record_disp = guard.pk_display(&self.schema);

            for (_, m, c) in info.columns() {
                // Foreign-key columns are validated through their reference
                // member; row versions belong to the backend.
                if c.foreign_key || c.row_version || c.is_read_only() {
                    continue;
                }

                if c.data_kind.is_string() {
                    if let Some(size) = c.size {
                        let over = match guard.get(c.value_index) {
                            Value::Text(s) => {
                                let len = s.chars().count();
                                (len > size as usize)
                                    .then(|| (len, s.chars().take(size as usize).collect::<String>()))
                            }
                            _ => None,
                        };
                        if let Some((len, truncated)) = over {
                            if c.auto.is_auto() {
                                guard.set(c.value_index, Value::Text(truncated));
                            } else {
                                faults.add_too_long(&info.name, &m.name, &record_disp, size, len);
                            }
                        }
                    }
                }

                if !c.auto.is_auto()
                    && !c.nullable
                    && guard.get(c.value_index).is_null_or_empty()
                {
                    faults.add_missing(&info.name, &m.name, &record_disp);
                }
            }

            for (mi, m) in info.members.iter().enumerate() {
                let Some(r) = m.as_reference() else { continue };
                if r.nullable {
                    continue;
                }
                if guard.pending_refs.iter().any(|(i, _)| *i == mi) {
                    continue;
                }
                let all_null = info.keys[r.from_key].expanded_members().iter().all(|em| {
                    let c = info.members[em.member]
                        .as_column()
                        .expect("expanded key members are columns");
                    guard.get(c.value_index).is_null()
                });
                if all_null {
                    faults.add_missing(&info.name, &m.name, &record_disp);
                }
            }
        }

        faults.into_result().map_err(Error::from)
    }

    /// Build the dependency-ordered batch: deletes child-first, inserts
    /// parent-first, updates last. Returns the batch plus the records in
    /// item order (for applying returned values).
    pub(crate) fn build_batch(
        &self,
        records: &[RecordRef],
    ) -> Result<(Vec<RecordRef>, SubmitBatch)> {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for rec in records {
            match rec.read().expect("record lock poisoned").status() {
                RecordStatus::Deleting => deletes.push(Arc::clone(rec)),
                RecordStatus::New => inserts.push(Arc::clone(rec)),
                RecordStatus::Modified => updates.push(Arc::clone(rec)),
                _ => {}
            }
        }

        let depth = |rec: &RecordRef| {
            self.schema
                .entity(rec.read().expect("record lock poisoned").entity())
                .depth
        };
        deletes.sort_by_key(|r| std::cmp::Reverse(depth(r)));
        inserts.sort_by_key(depth);

        let mut ordered: Vec<RecordRef> = Vec::new();
        let mut items: Vec<SubmitItem> = Vec::new();
        let mut insert_items: HashMap<usize, usize> = HashMap::new();

        for rec in &deletes {
            let guard = rec.read().expect("record lock poisoned");
            let info = self.schema.entity(guard.entity());
            let (where_columns, where_values, concurrency) =
                mutation_where(info, &guard, MutationOp::Delete)?;
            items.push(SubmitItem {
                op: MutationOp::Delete,
                entity: info.name.clone(),
                table: info.table_name.clone(),
                set_columns: Vec::new(),
                set_values: Vec::new(),
                where_columns,
                where_values,
                identity_links: Vec::new(),
                concurrency,
                record: ordered.len(),
            });
            drop(guard);
            ordered.push(Arc::clone(rec));
        }

        for rec in &inserts {
            let identity_links = self.resolve_pending_refs(rec, &insert_items)?;
            let guard = rec.read().expect("record lock poisoned");
            let info = self.schema.entity(guard.entity());

            let mut set_columns = Vec::new();
            let mut set_values = Vec::new();
            for (_, m, c) in info.columns() {
                let own_identity = c.auto == AutoValueKind::Identity && !c.foreign_key;
                if own_identity || c.row_version || c.no_insert {
                    continue;
                }
                set_columns.push(m.name.clone());
                set_values.push(guard.get(c.value_index).clone());
            }

            insert_items.insert(Arc::as_ptr(rec) as usize, items.len());
            items.push(SubmitItem {
                op: MutationOp::Insert,
                entity: info.name.clone(),
                table: info.table_name.clone(),
                set_columns,
                set_values,
                where_columns: Vec::new(),
                where_values: Vec::new(),
                identity_links,
                concurrency: None,
                record: ordered.len(),
            });
            drop(guard);
            ordered.push(Arc::clone(rec));
        }

        for rec in &updates {
            let identity_links = self.resolve_pending_refs(rec, &insert_items)?;
            let guard = rec.read().expect("record lock poisoned");
            let info = self.schema.entity(guard.entity());

            let mut set_columns = Vec::new();
            let mut set_values = Vec::new();
            for (_, m, c) in info.columns() {
                let own_identity = c.auto == AutoValueKind::Identity && !c.foreign_key;
                if c.primary_key || own_identity || c.row_version || c.no_update {
                    continue;
                }
                if guard.get(c.value_index) != guard.original(c.value_index) {
                    set_columns.push(m.name.clone());
                    set_values.push(guard.get(c.value_index).clone());
                }
            }
            // Deferred foreign keys must be present for the runner to fill.
            for link in &identity_links {
                if !set_columns.contains(&link.column) {
                    set_columns.push(link.column.clone());
                    set_values.push(Value::Null);
                }
            }
            if set_columns.is_empty() {
                continue;
            }

            let (where_columns, where_values, concurrency) =
                mutation_where(info, &guard, MutationOp::Update)?;
            items.push(SubmitItem {
                op: MutationOp::Update,
                entity: info.name.clone(),
                table: info.table_name.clone(),
                set_columns,
                set_values,
                where_columns,
                where_values,
                identity_links,
                concurrency,
                record: ordered.len(),
            });
            drop(guard);
            ordered.push(Arc::clone(rec));
        }

        Ok((ordered, SubmitBatch { items }))
    }

    /// Resolve a record's pending references: keys that became known are
    /// copied into the foreign-key columns; still-unassigned ones become
    /// identity links against earlier insert items.
    fn resolve_pending_refs(
        &self,
        rec: &RecordRef,
        insert_items: &HashMap<usize, usize>,
    ) -> Result<Vec<IdentityLink>> {
        let pending = rec
            .read()
            .expect("record lock poisoned")
            .pending_refs
            .clone();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let eid = rec.read().expect("record lock poisoned").entity();
        let info = self.schema.entity(eid);
        let mut links = Vec::new();

        for (member_index, target) in pending {
            let r = info.members[member_index]
                .as_reference()
                .expect("pending refs point at reference members");
            let (tke, tki) = r.to_key;
            let t_info = self.schema.entity(tke);

            let target_values: Vec<Value> = {
                let t_guard = target.read().expect("record lock poisoned");
                t_info.keys[tki]
                    .expanded_members()
                    .iter()
                    .map(|em| {
                        let c = t_info.members[em.member]
                            .as_column()
                            .expect("expanded key members are columns");
                        t_guard.get(c.value_index).clone()
                    })
                    .collect()
            };

            let fk_cols: Vec<(String, usize)> = info.keys[r.from_key]
                .expanded_members()
                .iter()
                .map(|em| {
                    let m = &info.members[em.member];
                    let c = m.as_column().expect("expanded key members are columns");
                    (m.name.clone(), c.value_index)
                })
                .collect();

            if target_values.iter().all(|v| !v.is_null()) {
                self.settle_pending_ref(rec, member_index, &target);
            } else {
                let Some(&source_item) = insert_items.get(&(Arc::as_ptr(&target) as usize))
                else {
                    return Err(Error::Custom(format!(
                        "'{}' references an unsaved '{}' row that is not part of this \
                         unit of work",
                        info.name, t_info.name
                    )));
                };
                if fk_cols.len() != 1 {
                    return Err(Error::Custom(format!(
                        "'{}' defers a composite key reference to '{}'; composite \
                         identity links are not supported",
                        info.name, t_info.name
                    )));
                }
                links.push(IdentityLink {
                    column: fk_cols[0].0.clone(),
                    source_item,
                });
            }
        }
        Ok(links)
    }

    /// Copy a pending reference target's key into the record's foreign-key
    /// columns, if the target's key is fully assigned. Returns whether the
    /// reference was settled.
    fn settle_pending_ref(&self, rec: &RecordRef, member_index: usize, target: &RecordRef) -> bool {
        let eid = rec.read().expect("record lock poisoned").entity();
        let info = self.schema.entity(eid);
        let Some(r) = info.members[member_index].as_reference() else {
            return false;
        };
        let (tke, tki) = r.to_key;
        let t_info = self.schema.entity(tke);

        let target_values: Vec<Value> = {
            let t_guard = target.read().expect("record lock poisoned");
            t_info.keys[tki]
                .expanded_members()
                .iter()
                .map(|em| {
                    let c = t_info.members[em.member]
                        .as_column()
                        .expect("expanded key members are columns");
                    t_guard.get(c.value_index).clone()
                })
                .collect()
        };
        if target_values.iter().any(Value::is_null) {
            return false;
        }

        let mut guard = rec.write().expect("record lock poisoned");
        for (em, value) in info.keys[r.from_key]
            .expanded_members()
            .iter()
            .zip(target_values)
        {
            let c = info.members[em.member]
                .as_column()
                .expect("expanded key members are columns");
            guard.set(c.value_index, value);
        }
        guard.pending_refs.retain(|(i, _)| *i != member_index);
        true
    }

    /// Success path: apply returned values, fire after-save hooks, commit
    /// all records and clear the working set.
    fn commit_after_submit(
        &mut self,
        ordered: &[RecordRef],
        batch: &SubmitBatch,
        outcome: &SubmitOutcome,
    ) -> Result<()> {
        for (item, result) in batch.items.iter().zip(&outcome.items) {
            if result.returned.is_empty() {
                continue;
            }
            let rec = &ordered[item.record];
            let mut guard = rec.write().expect("record lock poisoned");
            let info = self.schema.entity(guard.entity());
            for (column, value) in &result.returned {
                let slot = info
                    .member(column)
                    .and_then(|(_, m)| m.as_column())
                    .map(|c| c.value_index);
                if let Some(slot) = slot {
                    guard.set(slot, value.clone());
                }
            }
        }

        let records = self.changed_records();

        // Deferred references: parents now carry their backend-assigned
        // keys, so the children's foreign-key columns can be settled.
        for rec in &records {
            let pending = rec
                .read()
                .expect("record lock poisoned")
                .pending_refs
                .clone();
            for (member_index, target) in pending {
                self.settle_pending_ref(rec, member_index, &target);
            }
        }

        let mut hook_err: Option<Error> = None;
        for rec in &records {
            let entity_name = {
                let guard = rec.read().expect("record lock poisoned");
                self.schema.entity(guard.entity()).name.clone()
            };
            if let Some(hook) = self.hooks.saved(&entity_name) {
                if let Err(e) = hook(&mut rec.write().expect("record lock poisoned")) {
                    hook_err.get_or_insert(e);
                }
            }
        }

        for rec in &records {
            let (was_new, was_deleting, key) = {
                let mut guard = rec.write().expect("record lock poisoned");
                let was_new = guard.status() == RecordStatus::New;
                let was_deleting = guard.status() == RecordStatus::Deleting;
                guard.commit();
                (was_new, was_deleting, guard.primary_key(&self.schema))
            };

            if was_deleting {
                if let Some(key) = key {
                    self.records_loaded
                        .write()
                        .expect("identity map lock poisoned")
                        .remove(&key);
                }
            } else if was_new {
                if let Some(key) = key {
                    if !key.is_empty() {
                        self.records_loaded
                            .write()
                            .expect("identity map lock poisoned")
                            .insert(&key, rec);
                    }
                }
            }
        }

        self.changed_mut().clear();
        tracing::info!(records = records.len(), "unit of work committed");
        match hook_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Failure path: abort hooks in reverse order, drop transient records,
    /// keep everything else (including originals) for a retry.
    fn abort_save(&mut self) {
        let records = self.changed_records();

        for rec in records.iter().rev() {
            let entity_name = {
                let guard = rec.read().expect("record lock poisoned");
                self.schema.entity(guard.entity()).name.clone()
            };
            if let Some(hook) = self.hooks.aborted(&entity_name) {
                if let Err(e) = hook(&mut rec.write().expect("record lock poisoned")) {
                    tracing::warn!(entity = %entity_name, error = %e, "abort hook failed");
                }
            }
        }

        let transient: Vec<RecordRef> = records
            .iter()
            .filter(|r| r.read().expect("record lock poisoned").is_transient())
            .cloned()
            .collect();
        if !transient.is_empty() {
            self.changed_mut()
                .retain(|r| !r.read().expect("record lock poisoned").is_transient());
            let mut map = self
                .records_loaded
                .write()
                .expect("identity map lock poisoned");
            for rec in &transient {
                let mut guard = rec.write().expect("record lock poisoned");
                if let Some(key) = guard.primary_key(&self.schema) {
                    if !key.is_empty() {
                        map.remove(&key);
                    }
                }
                guard.set_status(RecordStatus::Fantom);
            }
        }

        tracing::warn!(
            records = records.len(),
            dropped = transient.len(),
            "unit of work aborted; changes retained for retry"
        );
    }

    /// Classify a driver error into the conflict taxonomy; anything with no
    /// known shape is surfaced as-is.
    fn classify_error(&self, error: Error) -> Error {
        match error {
            Error::Driver(d) => match self.parser.classify(&d) {
                Some(info) => Error::Conflict(info),
                None => Error::Driver(d),
            },
            other => other,
        }
    }
}

/// Fill clock-driven auto values: `CreatedOn` once for new records,
/// `UpdatedOn` on every save. Foreign-key mirror columns are never touched.
fn apply_auto_values(schema: &Schema, record: &mut EntityRecord, now: i64) {
    let info = schema.entity(record.entity());
    let status = record.status();
    for (_, _, c) in info.columns() {
        if c.foreign_key {
            continue;
        }
        match c.auto {
            AutoValueKind::CreatedOn
                if status == RecordStatus::New && record.get(c.value_index).is_null() =>
            {
                record.set(c.value_index, Value::Timestamp(now));
            }
            AutoValueKind::UpdatedOn
                if matches!(status, RecordStatus::New | RecordStatus::Modified) =>
            {
                record.set(c.value_index, Value::Timestamp(now));
            }
            _ => {}
        }
    }
}

/// Row-identifying columns for a mutation: the primary key's original
/// values, plus the original row version (and a concurrency guard) on
/// row-versioned entities.
fn mutation_where(
    info: &EntityInfo,
    record: &EntityRecord,
    op: MutationOp,
) -> Result<(Vec<String>, Vec<Value>, Option<ConcurrencyGuard>)> {
    let Some(pk) = info.primary_key() else {
        return Err(Error::Custom(format!(
            "'{}' has no primary key; its records cannot be mutated",
            info.name
        )));
    };

    let mut where_columns = Vec::new();
    let mut where_values = Vec::new();
    for em in pk.expanded_members() {
        let m = &info.members[em.member];
        let c = m.as_column().expect("expanded key members are columns");
        where_columns.push(m.name.clone());
        where_values.push(record.original(c.value_index).clone());
    }

    let concurrency = if info.has_row_version {
        let pk_display =
            EntityKey::new(record.entity(), where_values.clone()).to_string();
        let rv = info
            .row_version_member()
            .expect("row-versioned entity has a row-version column");
        let m = &info.members[rv];
        let c = m.as_column().expect("row version is a column");
        where_columns.push(m.name.clone());
        where_values.push(record.original(c.value_index).clone());
        Some(ConcurrencyGuard {
            tag: concurrency_tag(op.name(), &info.table_name, &pk_display),
        })
    } else {
        None
    };

    Ok((where_columns, where_values, concurrency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::NullRunner;
    use crate::{HookRegistry, Session};
    use relmodel_core::DataKind;
    use relmodel_schema::{Schema, SchemaBuilder};

    fn schema() -> Arc<Schema> {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Customer")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Name", DataKind::String, |c| c.size(50))
            .column("Email", DataKind::String, |c| c.size(100))
            .column("UpdatedOn", DataKind::Timestamp, |c| c.updated_on().nullable());
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference("Customer", "Customer")
            .column("Version", DataKind::RowVersion, |c| c.row_version().nullable())
            .column("Note", DataKind::String, |c| c.nullable());
        builder
            .entity("OrderLine")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference("Order", "Order")
            .column("Qty", DataKind::Int, |c| c);
        Arc::new(builder.build().expect("schema builds"))
    }

    fn session() -> Session<NullRunner> {
        Session::new(schema(), NullRunner)
    }

    #[test]
    fn validation_collects_all_faults_in_one_pass() {
        let session = session();
        let rec = session.new_entity("Customer").unwrap();
        // Name and Email both missing.
        let err = session.validate_changes().unwrap_err();
        let Error::Validation(faults) = err else {
            panic!("expected validation error");
        };
        assert_eq!(faults.faults.len(), 2);
        let members: Vec<&str> = faults.faults.iter().map(|f| f.member.as_str()).collect();
        assert!(members.contains(&"Name"));
        assert!(members.contains(&"Email"));
        drop(rec);
    }

    #[test]
    fn validation_reports_too_long_values() {
        let session = session();
        let rec = session.new_entity("Customer").unwrap();
        session
            .set_value(&rec, "Name", Value::Text("x".repeat(60)))
            .unwrap();
        session
            .set_value(&rec, "Email", Value::Text("a@b.c".into()))
            .unwrap();

        let err = session.validate_changes().unwrap_err();
        let Error::Validation(faults) = err else {
            panic!("expected validation error");
        };
        assert_eq!(faults.faults.len(), 1);
        assert_eq!(faults.faults[0].member, "Name");
        assert!(faults.faults[0].message.contains("50"));
    }

    #[test]
    fn missing_required_reference_is_a_fault() {
        let session = session();
        let rec = session.new_entity("Order").unwrap();

        let err = session.validate_changes().unwrap_err();
        let Error::Validation(faults) = err else {
            panic!("expected validation error");
        };
        assert!(faults.faults.iter().any(|f| f.member == "Customer"));
        drop(rec);
    }

    #[test]
    fn auto_values_fill_from_the_clock() {
        use relmodel_core::FixedClock;
        let session = Session::new(schema(), NullRunner)
            .with_clock(Arc::new(FixedClock::at(42_000_000)));
        let rec = session.new_entity("Customer").unwrap();
        session
            .set_value(&rec, "Name", Value::Text("Ada".into()))
            .unwrap();
        session
            .set_value(&rec, "Email", Value::Text("a@b.c".into()))
            .unwrap();

        session.run_saving_hooks().unwrap();
        assert_eq!(
            session.value(&rec, "UpdatedOn").unwrap(),
            Value::Timestamp(42_000_000)
        );
    }

    #[test]
    fn batch_orders_inserts_parent_first_with_identity_links() {
        let session = session();

        // Insert in reverse dependency order on purpose.
        let line = session.new_entity("OrderLine").unwrap();
        session.set_value(&line, "Qty", Value::Int(2)).unwrap();
        let order = session.new_entity("Order").unwrap();
        let customer = session.new_entity("Customer").unwrap();

        session.set_ref(&order, "Customer", Some(&customer)).unwrap();
        session.set_ref(&line, "Order", Some(&order)).unwrap();

        let live = session.changed_records();
        let (_, batch) = session.build_batch(&live).unwrap();

        let tables: Vec<&str> = batch.items.iter().map(|i| i.table.as_str()).collect();
        assert_eq!(tables, vec!["Customer", "Order", "OrderLine"]);

        // Pending identity references became links against earlier items.
        assert_eq!(batch.items[1].identity_links.len(), 1);
        assert_eq!(batch.items[1].identity_links[0].source_item, 0);
        assert_eq!(batch.items[1].identity_links[0].column, "Customer_Id");
        assert_eq!(batch.items[2].identity_links[0].source_item, 1);
    }

    #[test]
    fn row_versioned_mutations_carry_a_concurrency_guard() {
        let session = session();
        let eid = session.schema().entity_id("Order").unwrap();
        let mut rec = EntityRecord::with_status(session.schema(), eid, RecordStatus::Loaded);
        // Columns: Id, Version, Note, Customer_Id.
        rec.load_values(vec![
            Value::Int(5),
            Value::BigInt(3),
            Value::Text("n".into()),
            Value::Int(1),
        ]);
        let rec = session.attach(rec).unwrap();
        session
            .set_value(&rec, "Note", Value::Text("edited".into()))
            .unwrap();

        let live = session.changed_records();
        let (_, batch) = session.build_batch(&live).unwrap();
        assert_eq!(batch.items.len(), 1);
        let item = &batch.items[0];
        assert_eq!(item.op, MutationOp::Update);
        assert_eq!(item.where_columns, vec!["Id", "Version"]);
        assert_eq!(item.where_values, vec![Value::Int(5), Value::BigInt(3)]);
        let guard = item.concurrency.as_ref().expect("guard present");
        assert_eq!(guard.tag, "RowVersionConflict/Update/Order/5");
    }

    #[test]
    fn saving_hooks_spawn_records_processed_in_later_rounds() {
        let schema = schema();
        let audit_schema = Arc::clone(&schema);
        let hooks = HookRegistry::new().on_saving("Order", move |order, ctx| {
            // First sweep only: spawn one audit customer per order.
            if order.get(2).is_null() {
                order.set(2, Value::Text("audited".into()));
                let cid = ctx.schema().entity_id("Customer").unwrap();
                let mut audit = EntityRecord::new(ctx.schema(), cid);
                let info = ctx.schema().entity(cid);
                audit.set_value(info, "Name", Value::Text("audit".into()))?;
                audit.set_value(info, "Email", Value::Text("a@b.c".into()))?;
                ctx.spawn(audit);
            }
            Ok(())
        });
        let session = Session::new(audit_schema, NullRunner).with_hooks(hooks);

        let order = session.new_entity("Order").unwrap();
        assert_eq!(session.changed_records().len(), 1);

        session.run_saving_hooks().unwrap();
        // The spawned customer joined the working set exactly once.
        assert_eq!(session.changed_records().len(), 2);
        assert_eq!(
            session.value(&order, "Note").unwrap(),
            Value::Text("audited".into())
        );
    }

    #[test]
    fn divergent_saving_hooks_are_bounded() {
        let hooks = HookRegistry::new().on_saving("Customer", |_rec, ctx| {
            let cid = ctx.schema().entity_id("Customer").unwrap();
            ctx.spawn(EntityRecord::new(ctx.schema(), cid));
            Ok(())
        });
        let session = Session::new(schema(), NullRunner).with_hooks(hooks);

        let _rec = session.new_entity("Customer").unwrap();
        let err = session.run_saving_hooks().unwrap_err();
        assert!(err.to_string().contains("rounds"));
    }
}
