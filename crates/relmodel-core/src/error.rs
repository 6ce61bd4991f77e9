//! Error types for relmodel operations.
//!
//! Three of the categories are *batched*: schema-build problems and
//! validation faults are collected in full before being returned, so one
//! failed pass reports every problem rather than the first. Persistence
//! conflicts are always classified (see [`crate::conflict`]) before they are
//! re-thrown.

use crate::conflict::ConflictInfo;
use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Schema-build problems, collected over the whole build pass. Fatal.
    Schema(SchemaFaults),
    /// Save-time validation faults, collected over all changed records.
    Validation(ValidationFaults),
    /// A classified persistence conflict.
    Conflict(ConflictInfo),
    /// Infrastructure failure from the backend driver.
    Driver(DriverError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// A raw backend/driver failure, before or after a failed classification
/// attempt.
#[derive(Debug)]
pub struct DriverError {
    /// Vendor message text.
    pub message: String,
    /// SQLSTATE code, if the backend reports one (e.g. "23505").
    pub sqlstate: Option<String>,
    /// Vendor-specific numeric code, if any.
    pub vendor_code: Option<i64>,
    /// Underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    /// Create a driver error from a plain message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            vendor_code: None,
            source: None,
        }
    }

    /// Attach a SQLSTATE code.
    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// Attach a vendor-specific numeric code.
    #[must_use]
    pub fn with_vendor_code(mut self, code: i64) -> Self {
        self.vendor_code = Some(code);
        self
    }
}

// ============================================================================
// Schema faults
// ============================================================================

/// The kind of schema-build problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFaultKind {
    /// A key member name did not resolve to any member of the entity.
    UnknownMember,
    /// A referenced entity or key name did not resolve.
    UnknownReference,
    /// Key expansion did not converge: circular reference or genuinely
    /// missing member.
    CircularReference,
    /// Explicit foreign-key column names do not match the target key's
    /// column count.
    ColumnCountMismatch,
    /// A declared column clashes with its synthesized foreign-key role.
    ColumnTypeMismatch,
    /// A primary key was declared with zero members.
    EmptyPrimaryKey,
    /// Duplicate entity, member or key name.
    DuplicateName,
    /// Other invalid declaration.
    Invalid,
}

/// One schema-build problem.
#[derive(Debug, Clone)]
pub struct SchemaFault {
    /// Entity the problem belongs to.
    pub entity: String,
    /// Key name or spec, when the problem is key-scoped.
    pub key: Option<String>,
    /// Member name, when the problem is member-scoped.
    pub member: Option<String>,
    /// Problem kind.
    pub kind: SchemaFaultKind,
    /// Human-readable description.
    pub message: String,
}

/// All problems found during one schema build pass.
#[derive(Debug, Clone, Default)]
pub struct SchemaFaults {
    /// The collected problems, in discovery order.
    pub faults: Vec<SchemaFault>,
}

impl SchemaFaults {
    /// Create an empty fault container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any problems were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Record a problem.
    pub fn add(
        &mut self,
        entity: impl Into<String>,
        kind: SchemaFaultKind,
        message: impl Into<String>,
    ) {
        self.faults.push(SchemaFault {
            entity: entity.into(),
            key: None,
            member: None,
            kind,
            message: message.into(),
        });
    }

    /// Record a key-scoped problem.
    pub fn add_key(
        &mut self,
        entity: impl Into<String>,
        key: impl Into<String>,
        kind: SchemaFaultKind,
        message: impl Into<String>,
    ) {
        self.faults.push(SchemaFault {
            entity: entity.into(),
            key: Some(key.into()),
            member: None,
            kind,
            message: message.into(),
        });
    }

    /// Record a member-scoped problem.
    pub fn add_member(
        &mut self,
        entity: impl Into<String>,
        member: impl Into<String>,
        kind: SchemaFaultKind,
        message: impl Into<String>,
    ) {
        self.faults.push(SchemaFault {
            entity: entity.into(),
            key: None,
            member: Some(member.into()),
            kind,
            message: message.into(),
        });
    }

    /// Convert to Result: Ok(()) when no problems were recorded.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

// ============================================================================
// Validation faults
// ============================================================================

/// The kind of save-time validation fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFaultKind {
    /// Required value is null or empty.
    ValueMissing,
    /// String value exceeds the column's declared size.
    ValueTooLong,
}

/// One validation fault on one record member.
#[derive(Debug, Clone)]
pub struct ValidationFault {
    /// Entity name.
    pub entity: String,
    /// Member name.
    pub member: String,
    /// Display form of the record's primary key, when known.
    pub record: String,
    /// Fault kind.
    pub kind: ValidationFaultKind,
    /// Human-readable description.
    pub message: String,
}

/// All validation faults from one `save_changes` call.
#[derive(Debug, Clone, Default)]
pub struct ValidationFaults {
    /// The collected faults, across all changed records.
    pub faults: Vec<ValidationFault>,
}

impl ValidationFaults {
    /// Create an empty fault container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any faults were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Record a missing-value fault.
    pub fn add_missing(
        &mut self,
        entity: impl Into<String>,
        member: impl Into<String>,
        record: impl Into<String>,
    ) {
        let member = member.into();
        let message = format!("'{member}' requires a value");
        self.faults.push(ValidationFault {
            entity: entity.into(),
            member,
            record: record.into(),
            kind: ValidationFaultKind::ValueMissing,
            message,
        });
    }

    /// Record a too-long fault.
    pub fn add_too_long(
        &mut self,
        entity: impl Into<String>,
        member: impl Into<String>,
        record: impl Into<String>,
        max: u32,
        actual: usize,
    ) {
        let member = member.into();
        let message = format!("'{member}' exceeds {max} characters (got {actual})");
        self.faults.push(ValidationFault {
            entity: entity.into(),
            member,
            record: record.into(),
            kind: ValidationFaultKind::ValueTooLong,
            message,
        });
    }

    /// Convert to Result: Ok(()) when no faults were recorded.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

// ============================================================================
// Display / conversions
// ============================================================================

impl Error {
    /// Is this error worth retrying the whole unit of work for?
    ///
    /// Deadlocks are transient by definition; everything else needs caller
    /// intervention first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict(c) => c.kind.is_retryable(),
            _ => false,
        }
    }

    /// Get the classified conflict, if this is a conflict error.
    #[must_use]
    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            Error::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Schema(e) => write!(f, "Schema error: {e}"),
            Error::Validation(e) => write!(f, "Validation error: {e}"),
            Error::Conflict(e) => write!(f, "Persistence conflict: {e}"),
            Error::Driver(e) => write!(f, "Driver error: {e}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for SchemaFaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.faults.len() == 1 {
            let fault = &self.faults[0];
            write!(f, "{}: {}", fault.entity, fault.message)
        } else {
            writeln!(f, "{} schema problems:", self.faults.len())?;
            for fault in &self.faults {
                writeln!(f, "  - {}: {}", fault.entity, fault.message)?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for ValidationFaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.faults.len() == 1 {
            let fault = &self.faults[0];
            write!(f, "{} ({}): {}", fault.entity, fault.record, fault.message)
        } else {
            writeln!(f, "{} validation faults:", self.faults.len())?;
            for fault in &self.faults {
                writeln!(f, "  - {} ({}): {}", fault.entity, fault.record, fault.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for SchemaFaults {}
impl std::error::Error for ValidationFaults {}
impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<SchemaFaults> for Error {
    fn from(err: SchemaFaults) -> Self {
        Error::Schema(err)
    }
}

impl From<ValidationFaults> for Error {
    fn from(err: ValidationFaults) -> Self {
        Error::Validation(err)
    }
}

impl From<ConflictInfo> for Error {
    fn from(err: ConflictInfo) -> Self {
        Error::Conflict(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_faults_collect_and_convert() {
        let mut faults = SchemaFaults::new();
        assert!(faults.clone().into_result().is_ok());

        faults.add_key(
            "Order",
            "FK_Order_Customer",
            SchemaFaultKind::CircularReference,
            "key did not expand",
        );
        faults.add_member("Order", "Total", SchemaFaultKind::UnknownMember, "no such member");

        let err = faults.into_result().unwrap_err();
        assert_eq!(err.faults.len(), 2);
        assert_eq!(err.faults[0].key.as_deref(), Some("FK_Order_Customer"));
        assert_eq!(err.faults[1].member.as_deref(), Some("Total"));
    }

    #[test]
    fn validation_faults_message_content() {
        let mut faults = ValidationFaults::new();
        faults.add_missing("Customer", "Name", "new");
        faults.add_too_long("Customer", "Code", "42", 10, 17);

        assert_eq!(faults.faults[0].kind, ValidationFaultKind::ValueMissing);
        assert_eq!(faults.faults[1].kind, ValidationFaultKind::ValueTooLong);
        assert!(faults.faults[1].message.contains("10"));
        assert!(faults.faults[1].message.contains("17"));
    }

    #[test]
    fn driver_error_display_includes_sqlstate() {
        let err = DriverError::message("duplicate key").with_sqlstate("23505");
        assert_eq!(format!("{err}"), "duplicate key (SQLSTATE 23505)");
    }
}
