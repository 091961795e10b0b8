//! SQLite connection implementation.

use async_trait::async_trait;
use tokio_rusqlite::Connection;
use tracing::debug;

use super::statement::{self, SqliteStatement};
use super::MEMORY;
use crate::driver::{DriverConnection, DriverRows, DriverStatement, ExecResult};
use crate::error::{Error, Result};
use crate::value::Value;

/// A SQLite connection.
pub struct SqliteConnection {
    /// None once closed
    conn: Option<Connection>,
    path: String,
}

impl SqliteConnection {
    /// Open a SQLite database.
    ///
    /// Supports:
    /// - `:memory:` for in-memory database
    /// - File path or `file:` URI for disk-based database
    ///
    /// Enables WAL mode for file-based databases.
    pub async fn open(path: &str) -> Result<Self> {
        let is_memory = path == MEMORY || path.contains("mode=memory");
        let conn = if path == MEMORY {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };

        if !is_memory {
            conn.call(|c| {
                c.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA busy_timeout=5000;
                     PRAGMA cache_size=-64000;", // 64MB cache
                )?;
                Ok(())
            })
            .await?;
        }

        debug!(path, "opened sqlite database");
        Ok(Self {
            conn: Some(conn),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn handle(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    async fn batch(&self, sql: &'static str) -> Result<()> {
        self.handle()?
            .call(move |c| {
                c.execute_batch(sql)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for SqliteConnection {
    async fn prepare(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        let conn = self.handle()?.clone();
        let sql = query.to_string();
        let num_input = conn
            .call(move |c| {
                let stmt = c.prepare_cached(&sql)?;
                Ok(stmt.parameter_count())
            })
            .await?;
        Ok(Box::new(SqliteStatement::new(
            conn,
            query.to_string(),
            num_input,
        )))
    }

    async fn exec_direct(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        statement::exec(self.handle()?, query, args).await
    }

    async fn query_direct(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        Ok(Box::new(statement::query(self.handle()?, query, args).await?))
    }

    async fn exec_batch(&mut self, script: &str) -> Result<()> {
        let script = script.to_string();
        self.handle()?
            .call(move |c| {
                c.execute_batch(&script)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch("ROLLBACK").await
    }

    async fn ping(&mut self) -> Result<()> {
        self.handle()?
            .call(|c| {
                c.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().await?;
        debug!(path = %self.path, "closed sqlite database");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
