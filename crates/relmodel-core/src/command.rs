//! The command-runner contract.
//!
//! The session never produces SQL text. It hands fully described batches to
//! a [`CommandRunner`] — the seam behind which dialect SQL builders, drivers
//! and connection pooling live. Implementations must:
//!
//! - execute a [`SubmitBatch`] inside **one** transaction, all-or-nothing,
//!   preserving item order;
//! - fill [`SubmitItem::identity_links`] from earlier items' returned
//!   identity values before executing the linked item;
//! - surface a failed [`ConcurrencyGuard`] (zero affected rows on a guarded
//!   mutation) as a driver error whose message is the guard's preformatted
//!   tag, so the conflict classifier can parse it back.
//!
//! All operations are async and take a `Cx` context for cancellation and
//! timeout support.

use crate::error::Error;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// The kind of mutation a submit item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    /// Insert a new row.
    Insert,
    /// Update an existing row.
    Update,
    /// Delete an existing row.
    Delete,
}

impl MutationOp {
    /// Stable name used in concurrency tags and diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            MutationOp::Insert => "Insert",
            MutationOp::Update => "Update",
            MutationOp::Delete => "Delete",
        }
    }
}

/// A lookup-by-key request (load by primary key).
#[derive(Debug, Clone)]
pub struct KeyLookup {
    /// Entity name, for diagnostics.
    pub entity: String,
    /// Table to read.
    pub table: String,
    /// Key column names (the key's expanded columns, in order).
    pub key_columns: Vec<String>,
    /// Key values, positionally matching `key_columns`.
    pub key_values: Vec<Value>,
    /// Columns to return, in the order the caller expects values back.
    pub select_columns: Vec<String>,
}

/// An existence probe against an incoming foreign-key reference.
#[derive(Debug, Clone)]
pub struct ReferenceProbe {
    /// Referencing entity name.
    pub entity: String,
    /// Referencing table.
    pub table: String,
    /// The referencing foreign-key columns.
    pub fk_columns: Vec<String>,
    /// The referenced key values to probe for.
    pub key_values: Vec<Value>,
}

/// Row-count guard for a mutation on a row-versioned entity.
///
/// The executor must verify the mutation affected exactly one row and, if
/// not, fail the batch with a driver error carrying `tag` as its message.
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    /// Preformatted `<tag>/<operation>/<table>/<primaryKey>` message.
    pub tag: String,
}

/// A deferred foreign-key value: the column receives the identity value
/// returned by an earlier item in the same batch.
#[derive(Debug, Clone)]
pub struct IdentityLink {
    /// Column on this item's table to fill.
    pub column: String,
    /// Index of the batch item whose returned identity supplies the value.
    pub source_item: usize,
}

/// One mutation in a submit batch.
#[derive(Debug, Clone)]
pub struct SubmitItem {
    /// The mutation kind.
    pub op: MutationOp,
    /// Entity name, for diagnostics.
    pub entity: String,
    /// Target table.
    pub table: String,
    /// Columns being written (all insertable columns for inserts, changed
    /// columns for updates, empty for deletes).
    pub set_columns: Vec<String>,
    /// Values for `set_columns`, positionally matched.
    pub set_values: Vec<Value>,
    /// Row-identifying columns (primary key, plus the original row version
    /// on guarded mutations). Empty for inserts.
    pub where_columns: Vec<String>,
    /// Values for `where_columns`, positionally matched.
    pub where_values: Vec<Value>,
    /// Foreign-key columns whose values come from earlier items.
    pub identity_links: Vec<IdentityLink>,
    /// Affected-row-count guard, present on row-versioned mutations.
    pub concurrency: Option<ConcurrencyGuard>,
    /// Opaque caller correlation index (position in the session's changed
    /// set); echoed back untouched.
    pub record: usize,
}

/// A dependency-ordered set of mutations forming one unit of work.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    /// Items in execution order: deletes child-first, inserts parent-first,
    /// updates last.
    pub items: Vec<SubmitItem>,
}

impl SubmitBatch {
    /// Check if the batch has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Count items of the given kind.
    #[must_use]
    pub fn count(&self, op: MutationOp) -> usize {
        self.items.iter().filter(|i| i.op == op).count()
    }
}

/// Per-item execution result.
#[derive(Debug, Clone, Default)]
pub struct ItemOutcome {
    /// Rows affected.
    pub affected: u64,
    /// Backend-generated values to apply to the record: `(column, value)`
    /// pairs such as identity keys and refreshed row versions.
    pub returned: Vec<(String, Value)>,
}

/// Result of executing a whole batch.
#[derive(Debug, Clone, Default)]
pub struct SubmitOutcome {
    /// One entry per batch item, in batch order.
    pub items: Vec<ItemOutcome>,
}

/// Command execution contract consumed by the session.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait CommandRunner: Send + Sync {
    /// Fetch a single row by key. Returns the values of
    /// `lookup.select_columns`, in order, or `None` when no row matches.
    fn fetch_by_key(
        &self,
        cx: &Cx,
        lookup: &KeyLookup,
    ) -> impl Future<Output = Outcome<Option<Vec<Value>>, Error>> + Send;

    /// Execute a batch atomically. See the module docs for the ordering,
    /// identity-link and concurrency-guard obligations.
    fn submit(
        &self,
        cx: &Cx,
        batch: &SubmitBatch,
    ) -> impl Future<Output = Outcome<SubmitOutcome, Error>> + Send;

    /// Check whether any row of `probe.table` references the given key.
    fn reference_exists(
        &self,
        cx: &Cx,
        probe: &ReferenceProbe,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_by_op() {
        let item = |op| SubmitItem {
            op,
            entity: "E".to_string(),
            table: "e".to_string(),
            set_columns: vec![],
            set_values: vec![],
            where_columns: vec![],
            where_values: vec![],
            identity_links: vec![],
            concurrency: None,
            record: 0,
        };

        let batch = SubmitBatch {
            items: vec![
                item(MutationOp::Delete),
                item(MutationOp::Insert),
                item(MutationOp::Insert),
                item(MutationOp::Update),
            ],
        };

        assert_eq!(batch.len(), 4);
        assert_eq!(batch.count(MutationOp::Insert), 2);
        assert_eq!(batch.count(MutationOp::Update), 1);
        assert_eq!(batch.count(MutationOp::Delete), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn mutation_op_names() {
        assert_eq!(MutationOp::Insert.name(), "Insert");
        assert_eq!(MutationOp::Update.name(), "Update");
        assert_eq!(MutationOp::Delete.name(), "Delete");
    }
}
