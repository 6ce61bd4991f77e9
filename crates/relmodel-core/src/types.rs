//! Semantic column type definitions.

use serde::{Deserialize, Serialize};

/// Semantic data type of a column.
///
/// These are backend-neutral: a type registry (out of scope here) maps each
/// kind to the concrete vendor type. Sizes live on the column definition, not
/// in the kind, except for fixed-precision decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Bool,
    Int,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    String,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    Uuid,
    /// Backend-maintained row version used for optimistic concurrency.
    RowVersion,
}

impl DataKind {
    /// Check if this kind is string-like (subject to declared-size limits).
    #[must_use]
    pub const fn is_string(&self) -> bool {
        matches!(self, DataKind::String | DataKind::Text)
    }

    /// Check if this kind is numeric.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataKind::Int | DataKind::BigInt | DataKind::Double | DataKind::Decimal { .. }
        )
    }

    /// A stable lowercase name, used in diagnostics and key-type mismatch
    /// messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            DataKind::Bool => "bool",
            DataKind::Int => "int",
            DataKind::BigInt => "bigint",
            DataKind::Double => "double",
            DataKind::Decimal { .. } => "decimal",
            DataKind::String => "string",
            DataKind::Text => "text",
            DataKind::Binary => "binary",
            DataKind::Date => "date",
            DataKind::Time => "time",
            DataKind::Timestamp => "timestamp",
            DataKind::Uuid => "uuid",
            DataKind::RowVersion => "rowversion",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a column's value is produced automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoValueKind {
    /// Not auto-generated.
    #[default]
    None,
    /// Backend-assigned identity value, returned after insert.
    Identity,
    /// Set from the session clock when the record is first saved.
    CreatedOn,
    /// Set from the session clock on every save.
    UpdatedOn,
}

impl AutoValueKind {
    /// Check if the column receives its value automatically.
    #[must_use]
    pub const fn is_auto(&self) -> bool {
        !matches!(self, AutoValueKind::None)
    }
}

/// Action applied to referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteAction {
    /// Block the delete while references exist. The default.
    #[default]
    Restrict,
    /// Delete referencing rows along with the referenced row.
    Cascade,
    /// Null out the referencing columns.
    SetNull,
}

impl DeleteAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            DeleteAction::Restrict => "RESTRICT",
            DeleteAction::Cascade => "CASCADE",
            DeleteAction::SetNull => "SET NULL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_kinds() {
        assert!(DataKind::String.is_string());
        assert!(DataKind::Text.is_string());
        assert!(!DataKind::Int.is_string());
    }

    #[test]
    fn auto_value_flags() {
        assert!(!AutoValueKind::None.is_auto());
        assert!(AutoValueKind::Identity.is_auto());
        assert!(AutoValueKind::CreatedOn.is_auto());
    }

    #[test]
    fn delete_action_sql() {
        assert_eq!(DeleteAction::Restrict.as_sql(), "RESTRICT");
        assert_eq!(DeleteAction::Cascade.as_sql(), "CASCADE");
        assert_eq!(DeleteAction::SetNull.as_sql(), "SET NULL");
    }
}
