//! Weak per-session identity map.
//!
//! Keyed by `(entity, primary-key hash)` and holding weak references, the
//! map guarantees at most one live tracked instance per primary key per
//! session while letting the application drop records it no longer holds.
//! Correctness never depends on timely collection — only on
//! "same key, same live instance while referenced". Dead entries are pruned
//! opportunistically on mutation.

use crate::record::RecordRef;
use relmodel_schema::{EntityId, EntityKey, Schema};
use std::collections::HashMap;
use std::sync::{Arc, Weak, RwLock};

use crate::record::EntityRecord;

/// Weak identity map from primary key to tracked record.
#[derive(Default)]
pub struct RecordMap {
    entries: HashMap<(EntityId, u64), Weak<RwLock<EntityRecord>>>,
}

impl RecordMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live record by key.
    ///
    /// The stored hash is verified against the actual key values of the
    /// candidate record, so hash collisions cannot alias two keys.
    #[must_use]
    pub fn get(&self, key: &EntityKey, schema: &Schema) -> Option<RecordRef> {
        let entry = self.entries.get(&(key.entity, key.value_hash()))?;
        let arc = entry.upgrade()?;
        let matches = {
            let guard = arc.read().expect("record lock poisoned");
            guard.primary_key(schema).as_ref() == Some(key)
        };
        matches.then_some(arc)
    }

    /// Register a record under its key. An existing live entry for the same
    /// key is replaced.
    pub fn insert(&mut self, key: &EntityKey, record: &RecordRef) {
        self.entries
            .insert((key.entity, key.value_hash()), Arc::downgrade(record));
        self.prune();
    }

    /// Remove the entry for a key.
    pub fn remove(&mut self, key: &EntityKey) {
        self.entries.remove(&(key.entity, key.value_hash()));
    }

    /// Drop entries whose records have been collected.
    pub fn prune(&mut self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of entries, including not-yet-pruned dead ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use relmodel_core::{DataKind, Value};
    use relmodel_schema::SchemaBuilder;

    fn schema() -> Schema {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Customer")
            .column("Id", DataKind::Int, |c| c.primary_key())
            .column("Name", DataKind::String, |c| c.size(50));
        builder.build().expect("schema builds")
    }

    fn loaded_record(schema: &Schema, id: i32) -> RecordRef {
        let eid = schema.entity_id("Customer").unwrap();
        let mut rec = EntityRecord::with_status(schema, eid, RecordStatus::Loaded);
        rec.load_values(vec![Value::Int(id), Value::Text(format!("c{id}"))]);
        Arc::new(RwLock::new(rec))
    }

    #[test]
    fn same_key_returns_same_instance() {
        let schema = schema();
        let eid = schema.entity_id("Customer").unwrap();
        let mut map = RecordMap::new();

        let rec = loaded_record(&schema, 1);
        let key = EntityKey::new(eid, vec![Value::Int(1)]);
        map.insert(&key, &rec);

        let found = map.get(&key, &schema).expect("live entry");
        assert!(Arc::ptr_eq(&rec, &found));
    }

    #[test]
    fn dropped_records_are_gone() {
        let schema = schema();
        let eid = schema.entity_id("Customer").unwrap();
        let mut map = RecordMap::new();

        let key = EntityKey::new(eid, vec![Value::Int(1)]);
        {
            let rec = loaded_record(&schema, 1);
            map.insert(&key, &rec);
            assert!(map.get(&key, &schema).is_some());
        }
        assert!(map.get(&key, &schema).is_none());

        map.prune();
        assert!(map.is_empty());
    }

    #[test]
    fn remove_evicts_entry() {
        let schema = schema();
        let eid = schema.entity_id("Customer").unwrap();
        let mut map = RecordMap::new();

        let rec = loaded_record(&schema, 1);
        let key = EntityKey::new(eid, vec![Value::Int(1)]);
        map.insert(&key, &rec);

        map.remove(&key);
        assert!(map.get(&key, &schema).is_none());
    }

    #[test]
    fn mismatched_values_do_not_alias() {
        let schema = schema();
        let eid = schema.entity_id("Customer").unwrap();
        let mut map = RecordMap::new();

        let rec = loaded_record(&schema, 1);
        let key = EntityKey::new(eid, vec![Value::Int(1)]);
        map.insert(&key, &rec);

        let other = EntityKey::new(eid, vec![Value::Int(2)]);
        assert!(map.get(&other, &schema).is_none());
    }
}
