//! Forward-only row cursors.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::connection::{Deferred, Link};
use crate::context::Context;
use crate::driver::{DriverRows, Fetch};
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::value::{FromValue, Value};

/// Column names shared by a cursor and every row it yields.
pub type SharedColumns = Arc<[String]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Open,
    Exhausted,
    Closed,
}

/// A forward-only, pull-based iterator over the rows of one query.
///
/// The column sequence is fixed at creation. Reaching the end of the data
/// releases the server-side resources; so does closing early. A cursor
/// dropped while open has its rows closed by the connection before its next
/// round-trip. A cursor created through [`Pool::query`](crate::Pool::query)
/// also holds its connection lease until then.
pub struct RowCursor {
    raw: Option<Box<dyn DriverRows>>,
    columns: SharedColumns,
    link: Arc<Link>,
    epoch: u64,
    ctx: Context,
    state: CursorState,
    lease: Option<PooledConnection>,
}

impl RowCursor {
    pub(crate) fn new(raw: Box<dyn DriverRows>, link: Arc<Link>, ctx: Context) -> Self {
        let columns: SharedColumns = raw.columns().iter().cloned().collect();
        let epoch = link.epoch();
        Self {
            raw: Some(raw),
            columns,
            link,
            epoch,
            ctx,
            state: CursorState::Open,
            lease: None,
        }
    }

    /// Keep `lease` checked out until the cursor is exhausted or closed.
    pub(crate) fn hold_lease(mut self, lease: PooledConnection) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Advance by one row, writing it into `dest` (one slot per column).
    ///
    /// Returns `EndOfData` on normal exhaustion, and keeps returning it on
    /// later calls.
    pub async fn next(&mut self, dest: &mut [Value]) -> Result<Fetch> {
        match self.state {
            CursorState::Closed => return Err(Error::RowsClosed),
            CursorState::Exhausted => return Ok(Fetch::EndOfData),
            CursorState::Open => {}
        }
        if dest.len() != self.columns.len() {
            return Err(Error::Type(format!(
                "row buffer has {} slots for {} columns",
                dest.len(),
                self.columns.len()
            )));
        }
        self.link.ensure_current(self.epoch)?;

        let raw = self.raw.as_mut().ok_or(Error::RowsClosed)?;
        match self.link.run(&self.ctx, raw.next(dest)).await {
            Ok(Fetch::Row) => Ok(Fetch::Row),
            Ok(Fetch::EndOfData) => {
                self.release(CursorState::Exhausted).await;
                Ok(Fetch::EndOfData)
            }
            Err(e) => {
                self.release(CursorState::Closed).await;
                Err(e)
            }
        }
    }

    /// Advance by one row, returning it as an owned [`Row`].
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        let mut values: SmallVec<[Value; 16]> = SmallVec::new();
        values.resize(self.columns.len(), Value::Null);
        match self.next(&mut values).await? {
            Fetch::Row => Ok(Some(Row {
                columns: Arc::clone(&self.columns),
                values,
            })),
            Fetch::EndOfData => Ok(None),
        }
    }

    /// Drain the remaining rows.
    pub async fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Read the first row and close the cursor.
    pub async fn first_row(mut self) -> Result<Option<Row>> {
        let row = self.next_row().await?;
        self.close().await?;
        Ok(row)
    }

    /// Close the cursor, releasing server-side resources. Always legal.
    pub async fn close(&mut self) -> Result<()> {
        let res = match self.raw.as_mut() {
            Some(raw) if self.link.ensure_usable().is_ok() => raw.close().await,
            _ => Ok(()),
        };
        self.raw = None;
        self.lease = None;
        self.state = CursorState::Closed;
        res
    }

    async fn release(&mut self, state: CursorState) {
        if let Some(mut raw) = self.raw.take() {
            if self.link.ensure_usable().is_ok() {
                if let Err(e) = raw.close().await {
                    debug!(connection = self.link.id(), error = %e, "failed to close row stream");
                }
            }
        }
        self.lease = None;
        self.state = state;
    }
}

impl Drop for RowCursor {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if self.link.ensure_current(self.epoch).is_ok() {
                self.link.defer_close(Deferred::Rows(raw));
            }
        }
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("columns", &self.columns)
            .field("state", &self.state)
            .finish()
    }
}

/// One row read from a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Typed value at column `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| Error::ColumnNotFound(format!("#{index}")))?;
        T::from_value(value)
    }

    /// Typed value of the first column named `name`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
        self.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values.into_vec()
    }
}
