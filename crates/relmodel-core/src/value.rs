//! Dynamic column values.

use serde::{Deserialize, Serialize};

/// A dynamically-typed column value.
///
/// Entity records store their column state as arrays of `Value`; the same
/// type is used for primary-key tuples, command parameters and values
/// returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date as days since the Unix epoch
    Date(i32),

    /// Time of day as microseconds since midnight
    Time(i64),

    /// Timestamp as microseconds since the Unix epoch (UTC)
    Timestamp(i64),

    /// UUID as a 128-bit integer
    Uuid(u128),
}

impl Value {
    /// Check whether this value is NULL.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check whether this value is NULL or an empty string.
    ///
    /// This is the "missing" test used by save-time validation: an empty
    /// string in a required text column counts as absent.
    #[must_use]
    pub fn is_null_or_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// A short name for the value's runtime type, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Get the text content, if this is a `Text` value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as `i64`, widening `Int` if needed.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::BigInt(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal(s) => write!(f, "{s}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "date:{d}"),
            Value::Time(t) => write!(f, "time:{t}"),
            Value::Timestamp(ts) => write!(f, "ts:{ts}"),
            Value::Uuid(u) => write!(f, "{u:032x}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Hash a single value into the hasher.
///
/// Variants are tagged so that, e.g., `Int(0)` and `Bool(false)` never
/// collide structurally.
pub fn hash_value(v: &Value, hasher: &mut impl std::hash::Hasher) {
    use std::hash::Hash;

    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::BigInt(i) => {
            3u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(d) => {
            4u8.hash(hasher);
            d.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            6u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            7u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            8u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Time(t) => {
            9u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Timestamp(ts) => {
            10u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            11u8.hash(hasher);
            u.hash(hasher);
        }
    }
}

/// Hash a slice of values, e.g. a primary-key tuple.
#[must_use]
pub fn hash_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_value(v, &mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_detection() {
        assert!(Value::Null.is_null());
        assert!(Value::Null.is_null_or_empty());
        assert!(Value::Text(String::new()).is_null_or_empty());
        assert!(!Value::Text("x".to_string()).is_null_or_empty());
        assert!(!Value::Int(0).is_null_or_empty());
    }

    #[test]
    fn structural_hash_equality() {
        let a = vec![Value::BigInt(1), Value::Text("a".to_string())];
        let b = vec![Value::BigInt(1), Value::Text("a".to_string())];
        let c = vec![Value::BigInt(1), Value::Text("b".to_string())];

        assert_eq!(hash_values(&a), hash_values(&b));
        assert_ne!(hash_values(&a), hash_values(&c));
    }

    #[test]
    fn tagged_hash_separates_variants() {
        // Same bit pattern, different variant, must not collide.
        assert_ne!(
            hash_values(&[Value::Int(1)]),
            hash_values(&[Value::BigInt(1)])
        );
    }

    #[test]
    fn from_option_maps_none_to_null() {
        let v: Value = Option::<i64>::None.into();
        assert!(v.is_null());
        let v: Value = Some(7_i64).into();
        assert_eq!(v, Value::BigInt(7));
    }

    #[test]
    fn as_i64_widens_int() {
        assert_eq!(Value::Int(5).as_i64(), Some(5));
        assert_eq!(Value::BigInt(5).as_i64(), Some(5));
        assert_eq!(Value::Text("5".to_string()).as_i64(), None);
    }
}
