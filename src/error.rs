//! Error types for sqlbridge.
//!
//! Errors detected by this layer are raised before the server is contacted.
//! Errors reported by a backend are carried verbatim in [`Error::Server`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// No lease slot became free before the acquire timeout.
    #[error("connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(std::time::Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    /// The link to the server was lost or abandoned mid-operation.
    #[error("connection is broken")]
    ConnectionBroken,

    #[error("argument count mismatch: expected {expected}, given {given}")]
    ArgumentCount { expected: usize, given: usize },

    #[error("transaction has already been committed or rolled back")]
    TransactionFinished,

    /// Rollback was requested but the connection was lost, so the outcome on
    /// the server cannot be confirmed.
    #[error("transaction rolled back with indeterminate outcome: connection lost")]
    RolledBackIndeterminate,

    /// A failure reported by the backend (constraint violation, syntax error, ...).
    #[error("driver error{}: {message}", code_suffix(.code))]
    Server {
        code: Option<String>,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("statement is closed")]
    StatementClosed,

    #[error("row cursor is closed")]
    RowsClosed,

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("driver already registered: {0}")]
    DuplicateDriver(String),

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("operation not supported by driver: {0}")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("type conversion error: {0}")]
    Type(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a server error without a vendor code.
    pub fn server(message: impl Into<String>) -> Self {
        Error::Server {
            code: None,
            message: message.into(),
        }
    }

    /// Whether this error leaves the connection unusable.
    ///
    /// Cancellation counts: an operation abandoned halfway leaves the session
    /// in an unknown protocol state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionBroken | Error::Io(_) | Error::Cancelled | Error::DeadlineExceeded
        )
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;
