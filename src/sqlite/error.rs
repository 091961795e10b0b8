//! Mapping of SQLite failures onto the crate's error taxonomy.

use crate::error::Error;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, message) => Error::Server {
                code: Some(err.extended_code.to_string()),
                message: message.unwrap_or_else(|| err.to_string()),
            },
            rusqlite::Error::InvalidParameterCount(given, expected) => {
                Error::ArgumentCount { expected, given }
            }
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::ToSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => Error::Type(e.to_string()),
            other => Error::server(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error> for Error {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            // The database thread is gone
            tokio_rusqlite::Error::ConnectionClosed => Error::ConnectionBroken,
            tokio_rusqlite::Error::Rusqlite(e) => Error::from(e),
            other => Error::server(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violation_passes_through() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap();
        let err = Error::from(conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap_err());

        match err {
            Error::Server { code, message } => {
                // SQLITE_CONSTRAINT_PRIMARYKEY
                assert_eq!(code.as_deref(), Some("1555"));
                assert!(message.contains("UNIQUE"), "{message}");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn test_parameter_count_maps_to_argument_count() {
        let err = Error::from(rusqlite::Error::InvalidParameterCount(1, 2));
        assert!(matches!(err, Error::ArgumentCount { expected: 2, given: 1 }));
    }

    #[test]
    fn test_closed_thread_is_fatal() {
        assert!(Error::from(tokio_rusqlite::Error::ConnectionClosed).is_fatal());
    }
}
