//! Schema graph and key-expansion engine for relmodel.
//!
//! This crate turns a declaratively built graph of entities, members and
//! keys into a fully resolved relational schema:
//!
//! - `SchemaBuilder` populates the graph from code
//! - the key expander resolves declared key member lists into flat column
//!   lists, synthesizing foreign-key columns on the fly
//! - the built `Schema` is immutable and every key is `Expanded`
//!
//! All problems found during a build pass are collected and returned
//! together as `SchemaFaults`.

pub mod builder;
mod expand;
pub mod graph;

pub use builder::{
    ColumnDraft, EntityBuilder, IndexDraft, RefDraft, SchemaBuilder, SchemaOptions,
};
pub use graph::{
    ColumnDef, EntityId, EntityInfo, EntityKey, EntityKind, ExpandedKeyMember, KeyInfo, KeyMember,
    KeyStatus, KeyType, ListInfo, MemberInfo, MemberKind, ReferenceInfo, RelationKind, Schema,
};
