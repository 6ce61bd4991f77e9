//! Tracked entity records.
//!
//! An [`EntityRecord`] is one tracked row: a status, a current value array
//! and an original value array, both indexed by the column's `value_index`
//! from the schema. Records are shared as `Arc<RwLock<_>>` so the identity
//! map can hand out the same instance to every load path.

use relmodel_core::{Error, Result, Value};
use relmodel_schema::{EntityId, EntityInfo, EntityKey, MemberKind, Schema};
use std::sync::{Arc, RwLock};

/// Shared handle to a tracked record.
pub type RecordRef = Arc<RwLock<EntityRecord>>;

/// Lifecycle status of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Identity known, column values not loaded.
    Stub,
    /// A load round-trip is in flight.
    Loading,
    /// Loaded from the backend; unmodified.
    Loaded,
    /// Created in this session; never saved.
    New,
    /// Loaded, then mutated.
    Modified,
    /// Marked for deletion; not yet committed.
    Deleting,
    /// No longer represents a persisted or persistable row.
    Fantom,
}

impl RecordStatus {
    /// Statuses that participate in the save pipeline.
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        matches!(
            self,
            RecordStatus::New | RecordStatus::Modified | RecordStatus::Deleting
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordStatus::Stub => "stub",
            RecordStatus::Loading => "loading",
            RecordStatus::Loaded => "loaded",
            RecordStatus::New => "new",
            RecordStatus::Modified => "modified",
            RecordStatus::Deleting => "deleting",
            RecordStatus::Fantom => "fantom",
        };
        f.write_str(s)
    }
}

/// One tracked row of an entity.
#[derive(Debug)]
pub struct EntityRecord {
    entity: EntityId,
    status: RecordStatus,
    values: Vec<Value>,
    original: Vec<Value>,
    /// Id of the owning session, set on attach.
    pub(crate) session: Option<u64>,
    /// Discard this record from the working sets when a save aborts.
    transient: bool,
    /// Reference members whose target row has no key yet; resolved into
    /// identity links at submit time.
    pub(crate) pending_refs: Vec<(usize, RecordRef)>,
}

impl EntityRecord {
    /// Create a `New` record for an entity, all columns NULL.
    #[must_use]
    pub fn new(schema: &Schema, entity: EntityId) -> Self {
        Self::with_status(schema, entity, RecordStatus::New)
    }

    /// Create a record in an explicit status.
    #[must_use]
    pub fn with_status(schema: &Schema, entity: EntityId, status: RecordStatus) -> Self {
        let count = schema.entity(entity).column_count;
        Self {
            entity,
            status,
            values: vec![Value::Null; count],
            original: vec![Value::Null; count],
            session: None,
            transient: false,
            pending_refs: Vec::new(),
        }
    }

    /// The entity this record belongs to.
    #[must_use]
    pub const fn entity(&self) -> EntityId {
        self.entity
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> RecordStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    /// Whether the record is dropped from the working sets on a failed save.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.transient
    }

    /// Mark the record discard-on-abort (e.g. log rows generated as part of
    /// the save attempt).
    pub fn set_transient(&mut self, transient: bool) {
        self.transient = transient;
    }

    /// Current value of a column slot.
    #[must_use]
    pub fn get(&self, value_index: usize) -> &Value {
        &self.values[value_index]
    }

    /// Set the current value of a column slot. Does not touch the status;
    /// use the session's `set_value` for tracked mutation.
    pub fn set(&mut self, value_index: usize, value: Value) {
        self.values[value_index] = value;
    }

    /// Original (as-loaded) value of a column slot.
    #[must_use]
    pub fn original(&self, value_index: usize) -> &Value {
        &self.original[value_index]
    }

    /// Replace all current values. The slice length must match the entity's
    /// column count.
    pub(crate) fn load_values(&mut self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.values.len());
        self.original.clone_from(&values);
        self.values = values;
    }

    /// Read a column value by member name.
    pub fn value(&self, info: &EntityInfo, member: &str) -> Result<Value> {
        let (_, m) = info
            .member(member)
            .ok_or_else(|| unknown_member(info, member))?;
        match &m.kind {
            MemberKind::Column(c) => Ok(self.values[c.value_index].clone()),
            _ => Err(Error::Custom(format!(
                "member '{member}' of '{}' is not a column",
                info.name
            ))),
        }
    }

    /// Write a column value by member name. Does not touch the status.
    pub fn set_value(&mut self, info: &EntityInfo, member: &str, value: Value) -> Result<()> {
        let (_, m) = info
            .member(member)
            .ok_or_else(|| unknown_member(info, member))?;
        match &m.kind {
            MemberKind::Column(c) => {
                self.values[c.value_index] = value;
                Ok(())
            }
            _ => Err(Error::Custom(format!(
                "member '{member}' of '{}' is not a column",
                info.name
            ))),
        }
    }

    /// The record's primary-key value, or `None` when the entity has no
    /// primary key (views). The key may be empty while an identity value is
    /// unassigned.
    #[must_use]
    pub fn primary_key(&self, schema: &Schema) -> Option<EntityKey> {
        let info = schema.entity(self.entity);
        let pk = info.primary_key()?;
        let values = pk
            .expanded_members()
            .iter()
            .map(|em| {
                let c = info.members[em.member]
                    .as_column()
                    .expect("expanded key members are columns");
                self.values[c.value_index].clone()
            })
            .collect();
        Some(EntityKey::new(self.entity, values))
    }

    /// Display form of the primary key, `"new"` while unassigned.
    #[must_use]
    pub fn pk_display(&self, schema: &Schema) -> String {
        match self.primary_key(schema) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => "new".to_string(),
        }
    }

    /// Move current values into originals and settle the status after a
    /// successful save.
    pub(crate) fn commit(&mut self) {
        self.original.clone_from(&self.values);
        self.status = match self.status {
            RecordStatus::Deleting => RecordStatus::Fantom,
            RecordStatus::New | RecordStatus::Modified => RecordStatus::Loaded,
            other => other,
        };
        self.pending_refs.clear();
    }

    /// Restore current values from originals.
    pub(crate) fn revert(&mut self) {
        self.values.clone_from(&self.original);
        self.pending_refs.clear();
    }

    /// Refresh from a newer load of the same row. With `originals_only`,
    /// current values (local edits) are kept and only the as-loaded base is
    /// replaced.
    pub(crate) fn refresh_from(&mut self, other: &EntityRecord, originals_only: bool) {
        debug_assert_eq!(self.original.len(), other.values.len());
        self.original.clone_from(&other.values);
        if !originals_only {
            self.values.clone_from(&other.values);
        }
    }

    /// Diagnostic dump of the record as JSON: member name to value.
    #[must_use]
    pub fn to_json(&self, schema: &Schema) -> serde_json::Value {
        let info = schema.entity(self.entity);
        let mut map = serde_json::Map::new();
        map.insert(
            "$status".to_string(),
            serde_json::Value::String(self.status.to_string()),
        );
        for (_, m, c) in info.columns() {
            let v = serde_json::to_value(&self.values[c.value_index])
                .unwrap_or(serde_json::Value::Null);
            map.insert(m.name.clone(), v);
        }
        serde_json::Value::Object(map)
    }
}

fn unknown_member(info: &EntityInfo, member: &str) -> Error {
    Error::Custom(format!("'{}' has no member '{member}'", info.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::DataKind;
    use relmodel_schema::SchemaBuilder;

    fn schema() -> Schema {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Customer")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Name", DataKind::String, |c| c.size(50));
        builder.build().expect("schema builds")
    }

    #[test]
    fn new_record_starts_null() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let rec = EntityRecord::new(&schema, id);

        assert_eq!(rec.status(), RecordStatus::New);
        assert!(rec.get(0).is_null());
        assert!(rec.get(1).is_null());
        assert_eq!(rec.pk_display(&schema), "new");
    }

    #[test]
    fn value_roundtrip_by_member_name() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let info = schema.entity(id);
        let mut rec = EntityRecord::new(&schema, id);

        rec.set_value(info, "Name", Value::Text("Ada".into())).unwrap();
        assert_eq!(rec.value(info, "Name").unwrap(), Value::Text("Ada".into()));

        assert!(rec.value(info, "Missing").is_err());
    }

    #[test]
    fn commit_moves_values_and_settles_status() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let info = schema.entity(id);
        let mut rec = EntityRecord::with_status(&schema, id, RecordStatus::Modified);

        rec.set_value(info, "Name", Value::Text("Ada".into())).unwrap();
        assert!(rec.original(1).is_null());

        rec.commit();
        assert_eq!(rec.status(), RecordStatus::Loaded);
        assert_eq!(*rec.original(1), Value::Text("Ada".into()));
    }

    #[test]
    fn deleting_record_commits_to_fantom() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let mut rec = EntityRecord::with_status(&schema, id, RecordStatus::Deleting);
        rec.commit();
        assert_eq!(rec.status(), RecordStatus::Fantom);
    }

    #[test]
    fn revert_restores_originals() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let info = schema.entity(id);
        let mut rec = EntityRecord::with_status(&schema, id, RecordStatus::Loaded);
        rec.load_values(vec![Value::Int(1), Value::Text("Ada".into())]);

        rec.set_value(info, "Name", Value::Text("Grace".into())).unwrap();
        rec.revert();
        assert_eq!(rec.value(info, "Name").unwrap(), Value::Text("Ada".into()));
    }

    #[test]
    fn primary_key_reflects_assignment() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let info = schema.entity(id);
        let mut rec = EntityRecord::new(&schema, id);

        let key = rec.primary_key(&schema).unwrap();
        assert!(key.is_empty());

        rec.set_value(info, "Id", Value::Int(7)).unwrap();
        let key = rec.primary_key(&schema).unwrap();
        assert!(!key.is_empty());
        assert_eq!(key.values, vec![Value::Int(7)]);
    }

    #[test]
    fn json_dump_names_members() {
        let schema = schema();
        let id = schema.entity_id("Customer").unwrap();
        let info = schema.entity(id);
        let mut rec = EntityRecord::new(&schema, id);
        rec.set_value(info, "Name", Value::Text("Ada".into())).unwrap();

        let dump = rec.to_json(&schema);
        assert_eq!(dump["$status"], serde_json::json!("new"));
        assert!(dump.get("Name").is_some());
    }
}
