//! Core types and contracts for relmodel.
//!
//! This crate provides the foundational abstractions shared by the schema
//! resolver and the session layer:
//!
//! - `Value` dynamic column values and structural key hashing
//! - `DataKind` semantic column types
//! - The error taxonomy: batched schema faults, batched validation faults,
//!   classified persistence conflicts, driver failures
//! - The conflict classifier and its vendor-parser seam
//! - `CommandRunner`, the contract the session delegates round-trips to
//! - `Clock`, the injected time source for audit auto-values

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod clock;
pub mod command;
pub mod conflict;
pub mod error;
pub mod types;
pub mod value;

pub use clock::{Clock, FixedClock, SystemClock};
pub use command::{
    CommandRunner, ConcurrencyGuard, IdentityLink, ItemOutcome, KeyLookup, MutationOp,
    ReferenceProbe, SubmitBatch, SubmitItem, SubmitOutcome,
};
pub use conflict::{
    CONCURRENCY_TAG, ConflictInfo, ConflictKind, ConflictParser, StandardConflictParser,
    concurrency_tag,
};
pub use error::{
    DriverError, Error, Result, SchemaFault, SchemaFaultKind, SchemaFaults, ValidationFault,
    ValidationFaultKind, ValidationFaults,
};
pub use types::{AutoValueKind, DataKind, DeleteAction};
pub use value::{Value, hash_value, hash_values};
