//! Boundary values exchanged with drivers.
//!
//! Every textual value crosses the boundary as [`Value::Bytes`]; numeric,
//! temporal and boolean values use the closest native type. SQL NULL is
//! [`Value::Null`] on the wire side and [`Nullable`] on the caller side.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Values
// ============================================================================

/// A single column value or query argument.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Text and binary data. Text is UTF-8 encoded.
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl Value {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// View bytes as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to get as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Nullable<T>> for Value {
    fn from(value: Nullable<T>) -> Self {
        if value.valid {
            value.value.into()
        } else {
            Value::Null
        }
    }
}

// ============================================================================
// Nullable wrapper
// ============================================================================

/// A value plus a validity flag; `valid == false` means SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Nullable<T> {
    pub value: T,
    pub valid: bool,
}

impl<T> Nullable<T> {
    pub fn new(value: T) -> Self {
        Self { value, valid: true }
    }

    pub fn null() -> Self
    where
        T: Default,
    {
        Self {
            value: T::default(),
            valid: false,
        }
    }

    pub fn into_option(self) -> Option<T> {
        self.valid.then_some(self.value)
    }
}

// ============================================================================
// Typed extraction
// ============================================================================

/// Conversion from a boundary [`Value`] into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(target: &str, value: &Value) -> Result<T> {
    Err(Error::Type(format!("cannot convert {} to {}", value.kind(), target)))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            // Backends without a boolean type store 0/1
            Value::Int(i) => Ok(*i != 0),
            other => mismatch("bool", other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().map_or_else(|| mismatch("i64", value), Ok)
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| Error::Type(format!("{wide} out of range for i32")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().map_or_else(|| mismatch("f64", value), Ok)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => String::from_utf8(b.to_vec())
                .map_err(|e| Error::Type(format!("invalid UTF-8 text: {e}"))),
            other => mismatch("string", other),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Uuid(u) => Ok(Bytes::copy_from_slice(u.as_bytes())),
            other => mismatch("bytes", other),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        Bytes::from_value(value).map(|b| b.to_vec())
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            // Text storage uses RFC 3339
            Value::Bytes(_) => {
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::Type("timestamp text is not UTF-8".to_string()))?;
                DateTime::parse_from_rfc3339(text)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| Error::Type(format!("invalid timestamp {text:?}: {e}")))
            }
            other => mismatch("timestamp", other),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            // Text first; raw 16-byte form only when it is not text
            Value::Bytes(b) => match value.as_str() {
                Some(text) => Uuid::parse_str(text)
                    .map_err(|e| Error::Type(format!("invalid uuid {text:?}: {e}"))),
                None if b.len() == 16 => Uuid::from_slice(b).map_err(|e| Error::Type(e.to_string())),
                None => mismatch("uuid", value),
            },
            other => mismatch("uuid", other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue + Default> FromValue for Nullable<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Nullable::null()),
            other => T::from_value(other).map(Nullable::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_text_is_bytes() {
        let v = Value::from("hello");
        assert_eq!(v, Value::Bytes(Bytes::from_static(b"hello")));
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(String::from_value(&v).unwrap(), "hello");
    }

    #[test]
    fn test_null_into_nullable() {
        let n = Nullable::<i64>::from_value(&Value::Null).unwrap();
        assert!(!n.valid);
        assert_eq!(n.into_option(), None);

        let n = Nullable::<i64>::from_value(&Value::Int(7)).unwrap();
        assert!(n.valid);
        assert_eq!(n.value, 7);
        assert_eq!(Value::from(Nullable::<i64>::null()), Value::Null);
    }

    #[test]
    fn test_bool_from_int() {
        assert!(bool::from_value(&Value::Int(1)).unwrap());
        assert!(!bool::from_value(&Value::Int(0)).unwrap());
        assert!(bool::from_value(&Value::from("yes")).is_err());
    }

    #[test]
    fn test_timestamp_from_text() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let parsed = DateTime::<Utc>::from_value(&Value::from("2024-03-01T12:30:00Z")).unwrap();
        assert_eq!(parsed, expected);
        assert!(DateTime::<Utc>::from_value(&Value::from("yesterday")).is_err());
    }

    #[test]
    fn test_i32_range() {
        assert_eq!(i32::from_value(&Value::Int(42)).unwrap(), 42);
        assert!(i32::from_value(&Value::Int(i64::MAX)).is_err());
    }

    #[test]
    fn test_uuid_forms() {
        let id = Uuid::new_v4();
        assert_eq!(Uuid::from_value(&Value::Uuid(id)).unwrap(), id);
        assert_eq!(Uuid::from_value(&Value::from(id.to_string())).unwrap(), id);

        // 0xff never appears in UTF-8, so these bytes are read raw
        let raw = Uuid::from_bytes([0xff; 16]);
        assert_eq!(Uuid::from_value(&Value::from(raw.as_bytes().to_vec())).unwrap(), raw);
    }

    #[test]
    fn test_sixteen_char_text_is_not_a_raw_uuid() {
        assert!(matches!(
            Uuid::from_value(&Value::from("abcdefghijklmnop")),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Option::<f64>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Option::<f64>::from_value(&Value::Int(2)).unwrap(), Some(2.0));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
