//! SQLite type encoding and decoding.
//!
//! SQLite stores five storage classes. Values without a native class are
//! encoded as follows: booleans as integers 0/1, timestamps as RFC 3339 text,
//! UUIDs as hyphenated text, and bytes as TEXT when they are valid UTF-8,
//! BLOB otherwise.

use bytes::Bytes;
use chrono::SecondsFormat;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};

use crate::value::Value;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            // Borrow text and blobs to avoid copying parameters
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(_) => ToSqlOutput::Borrowed(ValueRef::Text(b)),
                Err(_) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            },
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Text(
                ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )),
            Value::Uuid(u) => ToSqlOutput::Owned(SqlValue::Text(u.hyphenated().to_string())),
        })
    }
}

/// Convert a column value read from SQLite.
pub fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(s) => Value::Bytes(Bytes::copy_from_slice(s)),
        ValueRef::Blob(b) => Value::Bytes(Bytes::copy_from_slice(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use crate::value::FromValue;

    fn round_trip(value: &Value) -> Value {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.query_row("SELECT ?1", [value], |row| Ok(from_value_ref(row.get_ref(0)?)))
            .unwrap()
    }

    #[test]
    fn test_text_binds_as_text() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let kind: String = conn
            .query_row("SELECT typeof(?1)", [Value::from("hello")], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "text");
    }

    #[test]
    fn test_invalid_utf8_binds_as_blob() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let kind: String = conn
            .query_row("SELECT typeof(?1)", [Value::from(vec![0xDE, 0xAD, 0xBE, 0xEF])], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(kind, "blob");
    }

    #[test]
    fn test_bool_decodes_from_integer() {
        let value = round_trip(&Value::Bool(true));
        assert_eq!(value, Value::Int(1));
        assert!(bool::from_value(&value).unwrap());
    }

    #[test]
    fn test_timestamp_decodes_from_text() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        let value = round_trip(&Value::Timestamp(ts));
        assert_eq!(value.as_str(), Some("2024-05-17T08:30:00Z"));
        assert_eq!(chrono::DateTime::<Utc>::from_value(&value).unwrap(), ts);
    }

    #[test]
    fn test_uuid_decodes_from_text() {
        let id = Uuid::new_v4();
        let value = round_trip(&Value::Uuid(id));
        assert_eq!(Uuid::from_value(&value).unwrap(), id);
    }

    #[test]
    fn test_null_and_numbers() {
        assert_eq!(round_trip(&Value::Null), Value::Null);
        assert_eq!(round_trip(&Value::Int(42)), Value::Int(42));
        assert_eq!(round_trip(&Value::Float(1.5)), Value::Float(1.5));
    }
}
