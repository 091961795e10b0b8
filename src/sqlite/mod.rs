//! SQLite backend.
//!
//! This module provides a driver for SQLite using rusqlite with
//! tokio-rusqlite for async support. Each connection owns one database
//! handle running on its own thread.
//!
//! Accepted data sources:
//! - `sqlite::memory:`, `:memory:` or an empty string for a private in-memory database
//! - `sqlite://path`, `sqlite:path` or a bare path for a database file
//! - `file:` URIs such as `file:shared?mode=memory&cache=shared`

pub mod connection;
pub mod error;
pub mod statement;
pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;

use crate::driver::{Capabilities, DataSource, Driver, DriverConnection};
use crate::error::Result;

pub use connection::SqliteConnection;
pub use statement::{SqliteRows, SqliteStatement};

/// Name the backend registers under.
pub const DRIVER_NAME: &str = "sqlite";

/// Path handed to SQLite for in-memory databases.
pub const MEMORY: &str = ":memory:";

/// Factory for [`SqliteConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn connect(&self, source: &DataSource) -> Result<Box<dyn DriverConnection>> {
        let conn = SqliteConnection::open(database_path(source.as_str())).await?;
        Ok(Box::new(conn))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_exec: true,
            direct_query: true,
            batch: true,
        }
    }
}

/// Register the SQLite driver in the process-wide registry as `"sqlite"`.
pub fn register() -> Result<()> {
    crate::registry::register(DRIVER_NAME, Arc::new(SqliteDriver))
}

/// Strip the `sqlite:` scheme from a data source.
pub(crate) fn database_path(source: &str) -> &str {
    let path = source
        .strip_prefix("sqlite://")
        .or_else(|| source.strip_prefix("sqlite:"))
        .unwrap_or(source);
    if path.is_empty() {
        MEMORY
    } else {
        path
    }
}
