//! Code-driven schema construction.
//!
//! The builder DSL populates the entity graph that the key expander then
//! resolves. Declarations are cheap drafts; nothing is validated until
//! [`SchemaBuilder::build`], which collects *all* problems found during the
//! build pass and returns them together.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = SchemaBuilder::new();
//!
//! builder
//!     .entity("Customer")
//!     .column("Id", DataKind::Int, |c| c.identity().primary_key())
//!     .column("Email", DataKind::String, |c| c.size(100).unique());
//!
//! builder
//!     .entity("Order")
//!     .column("Id", DataKind::Int, |c| c.identity().primary_key())
//!     .reference("Customer", "Customer")
//!     .column("Total", DataKind::Decimal { precision: 12, scale: 2 }, |c| c);
//!
//! let schema = builder.build()?;
//! ```

use crate::expand;
use crate::graph::{
    ColumnDef, EntityId, EntityInfo, EntityKind, KeyInfo, KeyMember, KeyStatus, KeyType, ListInfo,
    MemberInfo, MemberKind, ReferenceInfo, RelationKind, Schema,
};
use relmodel_core::{AutoValueKind, DataKind, DeleteAction, SchemaFaultKind, SchemaFaults};
use std::collections::HashMap;

/// Tunables for the schema build pass.
#[derive(Debug, Clone)]
pub struct SchemaOptions {
    /// Upper bound on key-expansion passes before a stuck key is reported as
    /// a circular reference.
    pub max_expansion_passes: usize,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            max_expansion_passes: 10,
        }
    }
}

// ============================================================================
// Drafts
// ============================================================================

/// Column declaration, configured through the closure passed to
/// [`EntityBuilder::column`].
#[derive(Debug, Clone)]
pub struct ColumnDraft {
    pub(crate) data_kind: DataKind,
    pub(crate) nullable: bool,
    pub(crate) size: Option<u32>,
    pub(crate) auto: AutoValueKind,
    pub(crate) primary_key: bool,
    pub(crate) unique: bool,
    pub(crate) indexed: bool,
    pub(crate) row_version: bool,
    pub(crate) no_insert: bool,
    pub(crate) no_update: bool,
}

impl ColumnDraft {
    fn new(data_kind: DataKind) -> Self {
        Self {
            data_kind,
            nullable: false,
            size: None,
            auto: AutoValueKind::None,
            primary_key: false,
            unique: false,
            indexed: false,
            row_version: false,
            no_insert: false,
            no_update: false,
        }
    }

    /// Allow NULL.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Declared size for string/binary columns.
    #[must_use]
    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// Backend-assigned identity value.
    #[must_use]
    pub fn identity(mut self) -> Self {
        self.auto = AutoValueKind::Identity;
        self
    }

    /// Filled from the session clock when first saved.
    #[must_use]
    pub fn created_on(mut self) -> Self {
        self.auto = AutoValueKind::CreatedOn;
        self
    }

    /// Filled from the session clock on every save.
    #[must_use]
    pub fn updated_on(mut self) -> Self {
        self.auto = AutoValueKind::UpdatedOn;
        self
    }

    /// Part of the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Covered by a single-column unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Covered by a single-column plain index.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Backend-maintained row version for optimistic concurrency.
    #[must_use]
    pub fn row_version(mut self) -> Self {
        self.row_version = true;
        self
    }

    /// Exclude from INSERT statements.
    #[must_use]
    pub fn no_insert(mut self) -> Self {
        self.no_insert = true;
        self
    }

    /// Exclude from UPDATE statements.
    #[must_use]
    pub fn no_update(mut self) -> Self {
        self.no_update = true;
        self
    }
}

/// Reference declaration, configured through the closure passed to
/// [`EntityBuilder::reference_with`].
#[derive(Debug, Clone)]
pub struct RefDraft {
    pub(crate) target: String,
    pub(crate) to_key: Option<String>,
    pub(crate) nullable: bool,
    pub(crate) on_delete: DeleteAction,
    pub(crate) fk_columns: Option<Vec<String>>,
}

impl RefDraft {
    fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            to_key: None,
            nullable: false,
            on_delete: DeleteAction::Restrict,
            fk_columns: None,
        }
    }

    /// Allow the reference to be absent.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Action applied when the referenced row is deleted.
    #[must_use]
    pub fn on_delete(mut self, action: DeleteAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Reference an explicitly named unique key instead of the target's
    /// primary key.
    #[must_use]
    pub fn to_key(mut self, key_name: impl Into<String>) -> Self {
        self.to_key = Some(key_name.into());
        self
    }

    /// Explicit names for the synthesized foreign-key columns; must match
    /// the target key's column count.
    #[must_use]
    pub fn fk_columns(mut self, names: &[&str]) -> Self {
        self.fk_columns = Some(names.iter().map(|s| (*s).to_string()).collect());
        self
    }
}

#[derive(Debug, Clone)]
enum ListDraft {
    OneToMany {
        target: String,
        via: Option<String>,
    },
    ManyToMany {
        link: String,
    },
}

/// Index declaration, configured through the closure passed to
/// [`EntityBuilder::index_with`].
#[derive(Debug, Clone)]
pub struct IndexDraft {
    pub(crate) spec: String,
    pub(crate) unique: bool,
    pub(crate) clustered: bool,
    pub(crate) name: Option<String>,
    pub(crate) include: Option<String>,
}

impl IndexDraft {
    fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            unique: false,
            clustered: false,
            name: None,
            include: None,
        }
    }

    /// Unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Clustered index.
    #[must_use]
    pub fn clustered(mut self) -> Self {
        self.clustered = true;
        self
    }

    /// Explicit index name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Include-column spec: member names resolved after key expansion.
    #[must_use]
    pub fn include(mut self, spec: impl Into<String>) -> Self {
        self.include = Some(spec.into());
        self
    }
}

#[derive(Debug, Clone)]
enum MemberDraft {
    Column { name: String, draft: ColumnDraft },
    Reference { name: String, draft: RefDraft },
    List { name: String, draft: ListDraft },
}

impl MemberDraft {
    fn name(&self) -> &str {
        match self {
            MemberDraft::Column { name, .. }
            | MemberDraft::Reference { name, .. }
            | MemberDraft::List { name, .. } => name,
        }
    }
}

// ============================================================================
// Entity builder
// ============================================================================

/// Declares one entity. Obtained from [`SchemaBuilder::entity`].
#[derive(Debug)]
pub struct EntityBuilder {
    name: String,
    table_name: Option<String>,
    kind: EntityKind,
    members: Vec<MemberDraft>,
    pk_spec: Option<String>,
    indexes: Vec<IndexDraft>,
}

impl EntityBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            kind: EntityKind::Table,
            members: Vec::new(),
            pk_spec: None,
            indexes: Vec::new(),
        }
    }

    /// Override the backend table name (defaults to the entity name).
    pub fn table(&mut self, name: impl Into<String>) -> &mut Self {
        self.table_name = Some(name.into());
        self
    }

    /// Mark this entity as a read-only view.
    pub fn view(&mut self) -> &mut Self {
        self.kind = EntityKind::View;
        self
    }

    /// Declare a column member.
    pub fn column(
        &mut self,
        name: impl Into<String>,
        data_kind: DataKind,
        configure: impl FnOnce(ColumnDraft) -> ColumnDraft,
    ) -> &mut Self {
        self.members.push(MemberDraft::Column {
            name: name.into(),
            draft: configure(ColumnDraft::new(data_kind)),
        });
        self
    }

    /// Declare an entity-reference member targeting another entity's
    /// primary key.
    pub fn reference(&mut self, name: impl Into<String>, target: impl Into<String>) -> &mut Self {
        self.reference_with(name, target, |r| r)
    }

    /// Declare an entity-reference member with extra configuration.
    pub fn reference_with(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        configure: impl FnOnce(RefDraft) -> RefDraft,
    ) -> &mut Self {
        self.members.push(MemberDraft::Reference {
            name: name.into(),
            draft: configure(RefDraft::new(target)),
        });
        self
    }

    /// Declare a one-to-many list over the target's back-reference to this
    /// entity. The back-reference member is auto-detected.
    pub fn one_to_many(&mut self, name: impl Into<String>, target: impl Into<String>) -> &mut Self {
        self.members.push(MemberDraft::List {
            name: name.into(),
            draft: ListDraft::OneToMany {
                target: target.into(),
                via: None,
            },
        });
        self
    }

    /// Declare a one-to-many list naming the target's back-reference member
    /// explicitly (needed when the target references this entity twice).
    pub fn one_to_many_via(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        via: impl Into<String>,
    ) -> &mut Self {
        self.members.push(MemberDraft::List {
            name: name.into(),
            draft: ListDraft::OneToMany {
                target: target.into(),
                via: Some(via.into()),
            },
        });
        self
    }

    /// Declare a many-to-many list through a link entity carrying two
    /// references.
    pub fn many_to_many(&mut self, name: impl Into<String>, link: impl Into<String>) -> &mut Self {
        self.members.push(MemberDraft::List {
            name: name.into(),
            draft: ListDraft::ManyToMany { link: link.into() },
        });
        self
    }

    /// Declare the primary key from a member-list spec (`"A,B:desc"`),
    /// overriding per-column `primary_key()` flags.
    pub fn primary_key(&mut self, spec: impl Into<String>) -> &mut Self {
        self.pk_spec = Some(spec.into());
        self
    }

    /// Declare a plain index from a member-list spec.
    pub fn index(&mut self, spec: impl Into<String>) -> &mut Self {
        self.index_with(spec, |ix| ix)
    }

    /// Declare an index with modifiers (unique, clustered, name, includes).
    pub fn index_with(
        &mut self,
        spec: impl Into<String>,
        configure: impl FnOnce(IndexDraft) -> IndexDraft,
    ) -> &mut Self {
        self.indexes.push(configure(IndexDraft::new(spec)));
        self
    }
}

// ============================================================================
// Schema builder
// ============================================================================

/// Collects entity declarations and builds the resolved [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    options: SchemaOptions,
    entities: Vec<EntityBuilder>,
}

impl SchemaBuilder {
    /// Create a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder with explicit options.
    #[must_use]
    pub fn with_options(options: SchemaOptions) -> Self {
        Self {
            options,
            entities: Vec::new(),
        }
    }

    /// Start (or continue) declaring an entity.
    pub fn entity(&mut self, name: &str) -> &mut EntityBuilder {
        if let Some(pos) = self.entities.iter().position(|e| e.name == name) {
            return &mut self.entities[pos];
        }
        self.entities.push(EntityBuilder::new(name));
        self.entities.last_mut().expect("just pushed")
    }

    /// Build the schema: materialize the graph, run key expansion to a
    /// fixpoint, and finalize. All problems found during the pass are
    /// collected and returned together.
    #[tracing::instrument(level = "info", skip(self), fields(entities = self.entities.len()))]
    pub fn build(self) -> Result<Schema, SchemaFaults> {
        let mut faults = SchemaFaults::new();

        // Name-level pass: duplicates and unresolved entity references make
        // the graph unconstructible, so they are collected and reported
        // before anything else runs.
        let by_name = self.check_names(&mut faults);
        if !faults.is_empty() {
            return Err(faults);
        }

        let mut entities = self.materialize(&by_name, &mut faults);
        self.create_keys(&mut entities, &by_name, &mut faults);

        expand::expand_keys(&mut entities, self.options.max_expansion_passes, &mut faults);
        expand::finalize(&mut entities);

        faults.into_result()?;

        tracing::info!(entities = entities.len(), "schema build complete");
        Ok(Schema { entities, by_name })
    }

    fn check_names(&self, faults: &mut SchemaFaults) -> HashMap<String, EntityId> {
        let mut by_name = HashMap::new();
        for (i, e) in self.entities.iter().enumerate() {
            if by_name.insert(e.name.clone(), EntityId(i)).is_some() {
                faults.add(
                    &e.name,
                    SchemaFaultKind::DuplicateName,
                    format!("duplicate entity '{}'", e.name),
                );
            }
        }

        for e in &self.entities {
            let mut seen = HashMap::new();
            for m in &e.members {
                if seen.insert(m.name().to_string(), ()).is_some() {
                    faults.add_member(
                        &e.name,
                        m.name(),
                        SchemaFaultKind::DuplicateName,
                        format!("duplicate member '{}'", m.name()),
                    );
                }
                let target = match m {
                    MemberDraft::Reference { draft, .. } => Some(&draft.target),
                    MemberDraft::List { draft, .. } => Some(match draft {
                        ListDraft::OneToMany { target, .. } => target,
                        ListDraft::ManyToMany { link } => link,
                    }),
                    MemberDraft::Column { .. } => None,
                };
                if let Some(target) = target {
                    if !by_name.contains_key(target) {
                        faults.add_member(
                            &e.name,
                            m.name(),
                            SchemaFaultKind::UnknownReference,
                            format!("unknown entity '{target}'"),
                        );
                    }
                }
            }
        }
        by_name
    }

    fn materialize(
        &self,
        by_name: &HashMap<String, EntityId>,
        faults: &mut SchemaFaults,
    ) -> Vec<EntityInfo> {
        let mut entities = Vec::with_capacity(self.entities.len());
        for e in &self.entities {
            let mut members = Vec::with_capacity(e.members.len());
            for m in &e.members {
                let kind = match m {
                    MemberDraft::Column { draft, .. } => {
                        let mut def = ColumnDef::new(draft.data_kind);
                        def.nullable = draft.nullable;
                        def.size = draft.size;
                        def.auto = draft.auto;
                        def.primary_key = draft.primary_key;
                        def.row_version = draft.row_version;
                        def.no_insert = draft.no_insert;
                        def.no_update = draft.no_update;
                        MemberKind::Column(def)
                    }
                    MemberDraft::Reference { draft, .. } => MemberKind::EntityRef(ReferenceInfo {
                        target: by_name[&draft.target],
                        from_key: usize::MAX,
                        to_key: (by_name[&draft.target], usize::MAX),
                        nullable: draft.nullable,
                        on_delete: draft.on_delete,
                    }),
                    MemberDraft::List { name, draft } => {
                        match self.resolve_list(&e.name, name, draft, by_name, faults) {
                            Some(list) => MemberKind::EntityList(list),
                            None => continue,
                        }
                    }
                };
                members.push(MemberInfo {
                    name: m.name().to_string(),
                    kind,
                });
            }

            entities.push(EntityInfo {
                name: e.name.clone(),
                table_name: e.table_name.clone().unwrap_or_else(|| e.name.clone()),
                kind: e.kind,
                members,
                keys: Vec::new(),
                primary_key: None,
                has_identity: false,
                references_identity: false,
                has_row_version: false,
                depth: 0,
                referenced_by: Vec::new(),
                column_count: 0,
            });
        }
        entities
    }

    fn resolve_list(
        &self,
        entity: &str,
        member: &str,
        draft: &ListDraft,
        by_name: &HashMap<String, EntityId>,
        faults: &mut SchemaFaults,
    ) -> Option<ListInfo> {
        match draft {
            ListDraft::OneToMany { target, via } => {
                let target_id = by_name[target];
                let target_builder = &self.entities[target_id.0];
                let back_refs: Vec<usize> = target_builder
                    .members
                    .iter()
                    .enumerate()
                    .filter_map(|(i, m)| match m {
                        MemberDraft::Reference { name, draft } if draft.target == entity => {
                            match via {
                                Some(v) if v != name => None,
                                _ => Some(i),
                            }
                        }
                        _ => None,
                    })
                    .collect();

                match back_refs.as_slice() {
                    [fk_member] => Some(ListInfo {
                        relation: RelationKind::OneToMany {
                            target: target_id,
                            fk_member: *fk_member,
                        },
                    }),
                    [] => {
                        faults.add_member(
                            entity,
                            member,
                            SchemaFaultKind::UnknownReference,
                            format!("'{target}' has no reference back to '{entity}'"),
                        );
                        None
                    }
                    _ => {
                        faults.add_member(
                            entity,
                            member,
                            SchemaFaultKind::Invalid,
                            format!(
                                "'{target}' references '{entity}' more than once; \
                                 use one_to_many_via"
                            ),
                        );
                        None
                    }
                }
            }
            ListDraft::ManyToMany { link } => {
                let link_id = by_name[link];
                let link_builder = &self.entities[link_id.0];
                let refs: Vec<(usize, &RefDraft)> = link_builder
                    .members
                    .iter()
                    .enumerate()
                    .filter_map(|(i, m)| match m {
                        MemberDraft::Reference { draft, .. } => Some((i, draft)),
                        _ => None,
                    })
                    .collect();

                if refs.len() != 2 {
                    faults.add_member(
                        entity,
                        member,
                        SchemaFaultKind::Invalid,
                        format!("link entity '{link}' must have exactly two references"),
                    );
                    return None;
                }

                let (to_this, to_other) = if refs[0].1.target == entity {
                    (refs[0].0, refs[1].0)
                } else if refs[1].1.target == entity {
                    (refs[1].0, refs[0].0)
                } else {
                    faults.add_member(
                        entity,
                        member,
                        SchemaFaultKind::UnknownReference,
                        format!("link entity '{link}' does not reference '{entity}'"),
                    );
                    return None;
                };

                Some(ListInfo {
                    relation: RelationKind::ManyToMany {
                        link: link_id,
                        to_this,
                        to_other,
                    },
                })
            }
        }
    }

    fn create_keys(
        &self,
        entities: &mut [EntityInfo],
        by_name: &HashMap<String, EntityId>,
        faults: &mut SchemaFaults,
    ) {
        // First sub-pass: primary keys, foreign keys, indexes. Foreign-key
        // target keys are resolved afterwards, once every entity has its
        // primary key in place.
        for (ei, builder) in self.entities.iter().enumerate() {
            let entity = &mut entities[ei];

            // Primary key: explicit spec wins, else columns flagged
            // primary_key() in declaration order.
            let mut pk = KeyInfo::new(KeyType::PrimaryKey);
            if let Some(spec) = &builder.pk_spec {
                pk.spec = Some(spec.clone());
            } else {
                pk.key_members = entity
                    .members
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.as_column().is_some_and(|c| c.primary_key))
                    .map(|(i, m)| KeyMember {
                        name: m.name.clone(),
                        member: Some(i),
                        desc: false,
                    })
                    .collect();
                if !pk.key_members.is_empty() {
                    pk.status = KeyStatus::Assigned;
                }
            }

            let declares_pk = pk.spec.is_some() || !pk.key_members.is_empty();
            match entity.kind {
                EntityKind::View => {
                    if declares_pk {
                        faults.add(
                            &entity.name,
                            SchemaFaultKind::Invalid,
                            "views cannot declare a primary key",
                        );
                    }
                }
                EntityKind::Table => {
                    if declares_pk {
                        entity.primary_key = Some(entity.keys.len());
                        entity.keys.push(pk);
                    } else {
                        faults.add(
                            &entity.name,
                            SchemaFaultKind::Invalid,
                            "entity has no primary key",
                        );
                    }
                }
            }

            // Foreign keys: one per reference member.
            for mi in 0..entity.members.len() {
                let Some(draft) = builder.members.iter().find_map(|m| match m {
                    MemberDraft::Reference { name, draft } if *name == entity.members[mi].name => {
                        Some(draft)
                    }
                    _ => None,
                }) else {
                    continue;
                };

                let mut fk = KeyInfo::new(KeyType::ForeignKey);
                fk.owner_member = Some(mi);
                fk.fk_column_names = draft.fk_columns.clone();
                let key_index = entity.keys.len();
                entity.keys.push(fk);

                if let MemberKind::EntityRef(r) = &mut entity.members[mi].kind {
                    r.from_key = key_index;
                }
            }

            // Indexes: entity-level drafts plus per-column unique/indexed
            // flags.
            for draft in &builder.indexes {
                let mut ix = KeyInfo::new(KeyType::Index);
                ix.spec = Some(draft.spec.clone());
                ix.unique = draft.unique;
                ix.clustered = draft.clustered;
                ix.name = draft.name.clone();
                ix.include_spec = draft.include.clone();
                entity.keys.push(ix);
            }
            let mut flag_indexes = Vec::new();
            for (mi, m) in entity.members.iter().enumerate() {
                if m.as_column().is_none() {
                    continue;
                }
                let flagged = builder.members.iter().find_map(|d| match d {
                    MemberDraft::Column { name, draft } if *name == m.name => Some(draft),
                    _ => None,
                });
                let Some(flagged) = flagged else { continue };
                if !flagged.unique && !flagged.indexed {
                    continue;
                }
                let mut ix = KeyInfo::new(KeyType::Index);
                ix.unique = flagged.unique;
                ix.owner_member = Some(mi);
                flag_indexes.push(ix);
            }
            entity.keys.extend(flag_indexes);
        }

        // Second sub-pass: resolve foreign-key targets now that primary keys
        // exist on every entity.
        for (ei, builder) in self.entities.iter().enumerate() {
            for mi in 0..entities[ei].members.len() {
                let Some(r) = entities[ei].members[mi].as_reference() else {
                    continue;
                };
                let target = r.target;
                let member_name = entities[ei].members[mi].name.clone();
                let draft = builder.members.iter().find_map(|m| match m {
                    MemberDraft::Reference { name, draft } if *name == member_name => Some(draft),
                    _ => None,
                });

                let to_key = match draft.and_then(|d| d.to_key.as_ref()) {
                    Some(key_name) => {
                        let found = entities[target.0]
                            .keys
                            .iter()
                            .position(|k| k.unique && k.name.as_deref() == Some(key_name));
                        match found {
                            Some(ki) => Some(ki),
                            None => {
                                faults.add_member(
                                    &entities[ei].name,
                                    &member_name,
                                    SchemaFaultKind::UnknownReference,
                                    format!(
                                        "'{}' has no unique key named '{key_name}'",
                                        entities[target.0].name
                                    ),
                                );
                                None
                            }
                        }
                    }
                    None => {
                        let found = entities[target.0].primary_key;
                        if found.is_none() {
                            faults.add_member(
                                &entities[ei].name,
                                &member_name,
                                SchemaFaultKind::UnknownReference,
                                format!("'{}' has no primary key", entities[target.0].name),
                            );
                        }
                        found
                    }
                };

                if let Some(ki) = to_key {
                    if let MemberKind::EntityRef(r) = &mut entities[ei].members[mi].kind {
                        r.to_key = (target, ki);
                    }
                } else if let Some(from_key) = entities[ei].members[mi]
                    .as_reference()
                    .map(|r| r.from_key)
                {
                    entities[ei].keys[from_key].failed = true;
                }
            }
        }
    }
}
