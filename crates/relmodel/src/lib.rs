//! relmodel - entity schema resolution and unit-of-work persistence.
//!
//! relmodel turns a declaratively built graph of entities, members and keys
//! into a fully resolved relational schema, and runs a unit-of-work session
//! over it:
//!
//! - **Schema builder + key expander**: declared keys (which may reference
//!   other entities, composite members, or be self-referential) expand into
//!   flat column-level keys, with foreign-key columns synthesized on the
//!   fly; genuine cycles and unresolved members fail the build with every
//!   problem reported at once.
//! - **Session**: identity-mapped record tracking, before-save hook
//!   fixpoint, batched validation, dependency-ordered submission through a
//!   pluggable command runner, and optimistic concurrency with a classified
//!   conflict taxonomy.
//!
//! # Quick start
//!
//! ```ignore
//! use relmodel::{DataKind, LoadMode, SchemaBuilder, Session, Value};
//!
//! let mut builder = SchemaBuilder::new();
//! builder
//!     .entity("Customer")
//!     .column("Id", DataKind::Int, |c| c.identity().primary_key())
//!     .column("Email", DataKind::String, |c| c.size(100).unique());
//! builder
//!     .entity("Order")
//!     .column("Id", DataKind::Int, |c| c.identity().primary_key())
//!     .reference("Customer", "Customer")
//!     .column("Version", DataKind::RowVersion, |c| c.row_version().nullable());
//! let schema = std::sync::Arc::new(builder.build()?);
//!
//! let mut session = Session::new(schema, runner);
//! let customer = session.new_entity("Customer")?;
//! session.set_value(&customer, "Email", Value::Text("a@b.c".into()))?;
//! session.save_changes(&cx).await?;
//! ```

// Re-export all public types from sub-crates
pub use relmodel_core::{
    AutoValueKind,
    // asupersync re-exports
    Budget,
    CONCURRENCY_TAG,
    Clock,
    CommandRunner,
    ConcurrencyGuard,
    ConflictInfo,
    ConflictKind,
    ConflictParser,
    Cx,
    DataKind,
    DeleteAction,
    DriverError,
    Error,
    FixedClock,
    IdentityLink,
    ItemOutcome,
    KeyLookup,
    MutationOp,
    Outcome,
    ReferenceProbe,
    Result,
    SchemaFault,
    SchemaFaultKind,
    SchemaFaults,
    StandardConflictParser,
    SubmitBatch,
    SubmitItem,
    SubmitOutcome,
    SystemClock,
    ValidationFault,
    ValidationFaultKind,
    ValidationFaults,
    Value,
    concurrency_tag,
};

pub use relmodel_schema::{
    ColumnDef, ColumnDraft, EntityBuilder, EntityId, EntityInfo, EntityKey, EntityKind,
    ExpandedKeyMember, IndexDraft, KeyInfo, KeyMember, KeyStatus, KeyType, ListInfo, MemberInfo,
    MemberKind, RefDraft, ReferenceInfo, RelationKind, Schema, SchemaBuilder, SchemaOptions,
};

pub use relmodel_session::{
    EntityRecord, EntitySet, HookContext, HookRegistry, LoadMode, RecordHook, RecordMap,
    RecordRef, RecordStatus, SavingHook, Session, SessionKind, SessionOptions,
};
