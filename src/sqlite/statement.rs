//! SQLite statements and buffered row streams.

use std::collections::VecDeque;

use async_trait::async_trait;
use rusqlite::params_from_iter;
use tokio_rusqlite::Connection;

use super::types::from_value_ref;
use crate::driver::{DriverRows, DriverStatement, ExecResult, Fetch};
use crate::error::{Error, Result};
use crate::value::Value;

/// Execute `sql` on the database thread.
/// Uses rusqlite's statement cache for repeated queries.
pub(crate) async fn exec(conn: &Connection, sql: &str, args: &[Value]) -> Result<ExecResult> {
    let sql = sql.to_string();
    let args = args.to_vec();

    let result = conn
        .call(move |c| {
            let mut stmt = c.prepare_cached(&sql)?;
            let changed = stmt.execute(params_from_iter(args.iter()))?;
            Ok(ExecResult::new(
                Some(c.last_insert_rowid()),
                Some(changed as u64),
            ))
        })
        .await?;
    Ok(result)
}

/// Run `sql` and buffer every row, so the stream outlives the statement.
pub(crate) async fn query(conn: &Connection, sql: &str, args: &[Value]) -> Result<SqliteRows> {
    let sql = sql.to_string();
    let args = args.to_vec();

    let (columns, rows) = conn
        .call(move |c| {
            let mut stmt = c.prepare_cached(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let width = columns.len();

            let mut buffered = VecDeque::new();
            let mut rows = stmt.query(params_from_iter(args.iter()))?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(from_value_ref(row.get_ref(i)?));
                }
                buffered.push_back(values);
            }
            Ok((columns, buffered))
        })
        .await?;

    Ok(SqliteRows { columns, rows })
}

/// A statement prepared on a SQLite connection.
///
/// The compiled statement lives in rusqlite's per-connection cache; this
/// handle only keeps the SQL text and its parameter count.
pub struct SqliteStatement {
    conn: Connection,
    query: String,
    num_input: usize,
    closed: bool,
}

impl SqliteStatement {
    pub(crate) fn new(conn: Connection, query: String, num_input: usize) -> Self {
        Self {
            conn,
            query,
            num_input,
            closed: false,
        }
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StatementClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl DriverStatement for SqliteStatement {
    fn num_input(&self) -> Option<usize> {
        Some(self.num_input)
    }

    async fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.check()?;
        exec(&self.conn, &self.query, args).await
    }

    async fn query(&mut self, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.check()?;
        Ok(Box::new(query(&self.conn, &self.query, args).await?))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStatement")
            .field("query", &self.query)
            .field("num_input", &self.num_input)
            .finish()
    }
}

/// Rows of one query, read eagerly.
#[derive(Debug)]
pub struct SqliteRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

#[async_trait]
impl DriverRows for SqliteRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self, dest: &mut [Value]) -> Result<Fetch> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(Fetch::EndOfData);
        };
        for (slot, value) in dest.iter_mut().zip(row) {
            *slot = value;
        }
        Ok(Fetch::Row)
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}
