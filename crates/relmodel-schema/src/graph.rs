//! The resolved entity graph: entities, members and keys.
//!
//! A [`Schema`] is immutable after build. It is produced only by
//! [`crate::SchemaBuilder::build`], which runs key expansion to completion —
//! every key in a built schema is `Expanded`, every column has a value-array
//! slot, and entity flags and incoming-reference lists are final.

use relmodel_core::{AutoValueKind, DataKind, DeleteAction, Value, hash_values};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index of an entity within its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub(crate) usize);

impl EntityId {
    /// The entity's position in [`Schema::entities`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Whether an entity maps to a table or a read-only view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityKind {
    /// A regular mutable table.
    #[default]
    Table,
    /// A read-only view; has no primary key and cannot be inserted into.
    View,
}

/// Column definition carried by a `Column` member.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Semantic data type.
    pub data_kind: DataKind,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Declared size for string/binary columns.
    pub size: Option<u32>,
    /// How the value is produced automatically, if at all.
    pub auto: AutoValueKind,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Declared or synthesized foreign-key column.
    pub foreign_key: bool,
    /// Backend-maintained optimistic-concurrency token.
    pub row_version: bool,
    /// Excluded from INSERT statements.
    pub no_insert: bool,
    /// Excluded from UPDATE statements.
    pub no_update: bool,
    /// Slot of this column in an entity record's value array.
    /// Assigned when the schema is finalized.
    pub value_index: usize,
}

impl ColumnDef {
    pub(crate) fn new(data_kind: DataKind) -> Self {
        Self {
            data_kind,
            nullable: false,
            size: None,
            auto: AutoValueKind::None,
            primary_key: false,
            foreign_key: false,
            row_version: false,
            no_insert: false,
            no_update: false,
            value_index: usize::MAX,
        }
    }

    /// Whether the column is excluded from both inserts and updates.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.no_insert && self.no_update
    }
}

/// Reference definition carried by an `EntityRef` member.
#[derive(Debug, Clone)]
pub struct ReferenceInfo {
    /// The referenced entity.
    pub target: EntityId,
    /// Index of the synthesized foreign key among the *owning* entity's keys.
    pub from_key: usize,
    /// The referenced key: target entity plus key index. The target's
    /// primary key unless an explicit unique key was named.
    pub to_key: (EntityId, usize),
    /// Whether the reference may be absent (FK columns nullable).
    pub nullable: bool,
    /// What happens to rows of the owning entity when the target row is
    /// deleted.
    pub on_delete: DeleteAction,
}

/// The shape of a one-to-many or many-to-many relation.
#[derive(Debug, Clone)]
pub enum RelationKind {
    /// Rows of `target` whose `fk_member` reference points back here.
    OneToMany {
        /// The child entity.
        target: EntityId,
        /// Index of the child's `EntityRef` member pointing back.
        fk_member: usize,
    },
    /// Rows related through a link entity carrying two references.
    ManyToMany {
        /// The link entity.
        link: EntityId,
        /// Index of the link's `EntityRef` member pointing to this entity.
        to_this: usize,
        /// Index of the link's `EntityRef` member pointing to the far side.
        to_other: usize,
    },
}

/// List definition carried by an `EntityList` member.
#[derive(Debug, Clone)]
pub struct ListInfo {
    /// The relation this list traverses.
    pub relation: RelationKind,
}

/// What kind of slot a member is.
#[derive(Debug, Clone)]
pub enum MemberKind {
    /// A concrete column.
    Column(ColumnDef),
    /// A reference to one row of another entity.
    EntityRef(ReferenceInfo),
    /// A list of related rows.
    EntityList(ListInfo),
}

/// A named slot on an entity.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    /// Member name; for columns this is also the column name.
    pub name: String,
    /// The member's kind and definition.
    pub kind: MemberKind,
}

impl MemberInfo {
    /// The column definition, if this member is a column.
    #[must_use]
    pub fn as_column(&self) -> Option<&ColumnDef> {
        match &self.kind {
            MemberKind::Column(c) => Some(c),
            _ => None,
        }
    }

    /// The reference definition, if this member is an entity reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<&ReferenceInfo> {
        match &self.kind {
            MemberKind::EntityRef(r) => Some(r),
            _ => None,
        }
    }

    /// The list definition, if this member is an entity list.
    #[must_use]
    pub fn as_list(&self) -> Option<&ListInfo> {
        match &self.kind {
            MemberKind::EntityList(l) => Some(l),
            _ => None,
        }
    }

    /// Check if this member is a concrete column.
    #[must_use]
    pub fn is_column(&self) -> bool {
        matches!(self.kind, MemberKind::Column(_))
    }
}

// ============================================================================
// Keys
// ============================================================================

/// The kind of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// The entity's primary key.
    PrimaryKey,
    /// A foreign key synthesized for an `EntityRef` member.
    ForeignKey,
    /// A plain or unique index.
    Index,
}

/// Resolution state of a key's member list. Monotonic:
/// `Listed → Assigned → Expanded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyStatus {
    /// Member names parsed, not all resolved to members yet.
    Listed,
    /// Every named member resolved to a member of the entity.
    Assigned,
    /// Every key member is a concrete column; composite foreign keys fully
    /// unrolled.
    Expanded,
}

/// One declared key member: a name, its resolution, and sort direction.
#[derive(Debug, Clone)]
pub struct KeyMember {
    /// The member name as declared.
    pub name: String,
    /// The resolved member index, once assigned.
    pub member: Option<usize>,
    /// Descending sort order.
    pub desc: bool,
}

/// One expanded key member: a concrete column plus sort direction.
#[derive(Debug, Clone, Copy)]
pub struct ExpandedKeyMember {
    /// Index of the column member.
    pub member: usize,
    /// Descending sort order.
    pub desc: bool,
}

/// A key of an entity.
///
/// Code outside the resolver must only read [`KeyInfo::expanded_members`] of
/// a key that has reached `Expanded`; a built [`Schema`] contains only such
/// keys.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// The kind of key.
    pub key_type: KeyType,
    /// Unique modifier (indexes; implied for primary keys).
    pub unique: bool,
    /// Clustered modifier.
    pub clustered: bool,
    pub(crate) name: Option<String>,
    pub(crate) spec: Option<String>,
    pub(crate) owner_member: Option<usize>,
    pub(crate) key_members: Vec<KeyMember>,
    pub(crate) expanded: Vec<ExpandedKeyMember>,
    pub(crate) status: KeyStatus,
    pub(crate) fk_column_names: Option<Vec<String>>,
    pub(crate) include_spec: Option<String>,
    pub(crate) include_members: Vec<usize>,
    pub(crate) failed: bool,
}

impl KeyInfo {
    pub(crate) fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            unique: matches!(key_type, KeyType::PrimaryKey),
            clustered: false,
            name: None,
            spec: None,
            owner_member: None,
            key_members: Vec::new(),
            expanded: Vec::new(),
            status: KeyStatus::Listed,
            fk_column_names: None,
            include_spec: None,
            include_members: Vec::new(),
            failed: false,
        }
    }

    /// The key's resolved name (explicit or synthesized).
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Current resolution status.
    #[must_use]
    pub const fn status(&self) -> KeyStatus {
        self.status
    }

    /// The declared key members.
    #[must_use]
    pub fn key_members(&self) -> &[KeyMember] {
        &self.key_members
    }

    /// The expanded, column-only key members.
    ///
    /// # Panics
    ///
    /// Panics if the key has not reached `Expanded`; this cannot happen for
    /// keys of a built schema.
    #[must_use]
    pub fn expanded_members(&self) -> &[ExpandedKeyMember] {
        assert!(
            self.status == KeyStatus::Expanded,
            "key '{}' read before expansion",
            self.name()
        );
        &self.expanded
    }

    /// Include columns of an index key (member indices).
    #[must_use]
    pub fn include_members(&self) -> &[usize] {
        &self.include_members
    }
}

// ============================================================================
// Entities
// ============================================================================

/// One mapped entity: a table or view plus its declared members and keys.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    /// Stable entity name.
    pub name: String,
    /// Backend table (or view) name.
    pub table_name: String,
    /// Table or view.
    pub kind: EntityKind,
    /// Ordered members.
    pub members: Vec<MemberInfo>,
    /// Keys, including the synthesized foreign keys.
    pub keys: Vec<KeyInfo>,
    /// Index of the primary key within `keys`; `None` only for views.
    pub primary_key: Option<usize>,
    /// Any column is a backend-assigned identity.
    pub has_identity: bool,
    /// Any foreign-key column mirrors a backend-assigned identity.
    pub references_identity: bool,
    /// The entity carries a row-version column.
    pub has_row_version: bool,
    /// Foreign-key depth used for dependency-ordered submission: entities
    /// with no references have depth 0, referencing entities sit deeper.
    pub depth: usize,
    /// Incoming references: `(referencing entity, its ref-member index)`.
    pub referenced_by: Vec<(EntityId, usize)>,
    /// Number of value-array slots (one per column member).
    pub column_count: usize,
}

impl EntityInfo {
    /// Look up a member by name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<(usize, &MemberInfo)> {
        self.members
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
    }

    /// Look up a member index by name.
    #[must_use]
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.member(name).map(|(i, _)| i)
    }

    /// The primary key, if the entity has one.
    #[must_use]
    pub fn primary_key(&self) -> Option<&KeyInfo> {
        self.primary_key.map(|i| &self.keys[i])
    }

    /// Iterate column members as `(member index, member, column)`.
    pub fn columns(&self) -> impl Iterator<Item = (usize, &MemberInfo, &ColumnDef)> {
        self.members.iter().enumerate().filter_map(|(i, m)| {
            m.as_column().map(|c| (i, m, c))
        })
    }

    /// Index of the row-version column member, if any.
    #[must_use]
    pub fn row_version_member(&self) -> Option<usize> {
        self.columns()
            .find(|(_, _, c)| c.row_version)
            .map(|(i, _, _)| i)
    }

    /// Look up a key by name.
    #[must_use]
    pub fn key(&self, name: &str) -> Option<&KeyInfo> {
        self.keys.iter().find(|k| k.name.as_deref() == Some(name))
    }
}

/// The resolved schema: all entities, fully expanded.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub(crate) entities: Vec<EntityInfo>,
    pub(crate) by_name: HashMap<String, EntityId>,
}

impl Schema {
    /// Resolve an entity name to its id.
    #[must_use]
    pub fn entity_id(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied()
    }

    /// Get an entity by id.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> &EntityInfo {
        &self.entities[id.0]
    }

    /// Get an entity by name.
    #[must_use]
    pub fn entity_by_name(&self, name: &str) -> Option<&EntityInfo> {
        self.entity_id(name).map(|id| self.entity(id))
    }

    /// Iterate all entities with their ids.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &EntityInfo)> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| (EntityId(i), e))
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the schema has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ============================================================================
// Runtime key values
// ============================================================================

/// An ordered tuple of concrete values for a key's expanded columns.
///
/// Equality and hashing are structural: two `EntityKey`s are equal iff the
/// entity matches and all component values are equal, independent of where
/// the values came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityKey {
    /// The entity the key belongs to.
    pub entity: EntityId,
    /// Key values in expanded-column order.
    pub values: Vec<Value>,
}

impl EntityKey {
    /// Create a key value.
    #[must_use]
    pub fn new(entity: EntityId, values: Vec<Value>) -> Self {
        Self { entity, values }
    }

    /// A key is empty when any component is NULL — e.g. an identity value
    /// not yet assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() || self.values.iter().any(Value::is_null)
    }

    /// Structural hash of the key values.
    #[must_use]
    pub fn value_hash(&self) -> u64 {
        hash_values(&self.values)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for v in &self.values {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_structural_equality() {
        let a = EntityKey::new(EntityId(0), vec![Value::Int(1), Value::Text("x".into())]);
        let b = EntityKey::new(EntityId(0), vec![Value::Int(1), Value::Text("x".into())]);
        let c = EntityKey::new(EntityId(0), vec![Value::Int(2), Value::Text("x".into())]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.value_hash(), b.value_hash());
        assert_ne!(a.value_hash(), c.value_hash());
    }

    #[test]
    fn entity_key_empty_when_any_null() {
        let unassigned = EntityKey::new(EntityId(0), vec![Value::Null]);
        assert!(unassigned.is_empty());

        let partial = EntityKey::new(EntityId(0), vec![Value::Int(1), Value::Null]);
        assert!(partial.is_empty());

        let full = EntityKey::new(EntityId(0), vec![Value::Int(1)]);
        assert!(!full.is_empty());
    }

    #[test]
    fn key_status_is_ordered() {
        assert!(KeyStatus::Listed < KeyStatus::Assigned);
        assert!(KeyStatus::Assigned < KeyStatus::Expanded);
    }

    #[test]
    #[should_panic(expected = "read before expansion")]
    fn expanded_members_guards_status() {
        let key = KeyInfo::new(KeyType::Index);
        let _ = key.expanded_members();
    }
}
