//! Transactions.

use tracing::warn;

use crate::connection::{ConnState, Connection};
use crate::context::Context;
use crate::driver::ExecResult;
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::rows::{Row, RowCursor};
use crate::statement::Statement;
use crate::value::Value;

/// Lifecycle state of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

enum TxConn<'c> {
    Borrowed(&'c mut Connection),
    Leased(PooledConnection),
}

impl TxConn<'_> {
    fn get(&mut self) -> Option<&mut Connection> {
        match self {
            TxConn::Borrowed(conn) => Some(&mut **conn),
            TxConn::Leased(lease) => lease.connection().ok(),
        }
    }
}

/// A scoped sequence of operations on one connection, ending in exactly one
/// commit or rollback.
///
/// A transaction begun through [`Pool::begin`](crate::Pool::begin) owns its
/// lease and hands the connection back to the pool when it ends. Dropping a
/// transaction that is still active flags its connection broken, so the
/// connection is closed rather than reused with an open transaction.
pub struct Transaction<'c> {
    conn: Option<TxConn<'c>>,
    state: TxState,
}

impl<'c> Transaction<'c> {
    pub(crate) fn borrowed(conn: &'c mut Connection) -> Self {
        Self {
            conn: Some(TxConn::Borrowed(conn)),
            state: TxState::Active,
        }
    }

    pub(crate) fn leased(lease: PooledConnection) -> Transaction<'static> {
        Transaction {
            conn: Some(TxConn::Leased(lease)),
            state: TxState::Active,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    fn active_conn(&mut self) -> Result<&mut Connection> {
        if self.state != TxState::Active {
            return Err(Error::TransactionFinished);
        }
        self.conn
            .as_mut()
            .and_then(TxConn::get)
            .ok_or(Error::ConnectionClosed)
    }

    pub async fn exec(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.active_conn()?.exec(ctx, query, args).await
    }

    pub async fn query(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<RowCursor> {
        self.active_conn()?.query(ctx, query, args).await
    }

    pub async fn query_row(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        self.active_conn()?.query_row(ctx, query, args).await
    }

    pub async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<Statement> {
        self.active_conn()?.prepare(ctx, query).await
    }

    /// Commit the transaction.
    ///
    /// The transaction is terminal afterwards whatever the outcome: a failed
    /// commit leaves it `RolledBack` and is never retryable.
    pub async fn commit(&mut self, ctx: &Context) -> Result<()> {
        let conn = self.active_conn()?;
        let res = match conn.commit_raw(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The server may have left the transaction open
                if !e.is_fatal() && conn.is_usable() {
                    if let Err(rollback_err) = conn.rollback_raw(ctx).await {
                        warn!(connection = conn.id(), error = %rollback_err, "rollback after failed commit failed");
                        conn.mark_broken();
                    }
                }
                Err(e)
            }
        };
        self.state = if res.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        self.finish().await;
        res
    }

    /// Roll the transaction back.
    ///
    /// Fails with `RolledBackIndeterminate` when the connection is broken or
    /// breaks during the rollback: the server discards the transaction with
    /// the session, but the rollback was not confirmed.
    pub async fn rollback(&mut self, ctx: &Context) -> Result<()> {
        let conn = self.active_conn()?;
        let res = match conn.state() {
            ConnState::Closed => Err(Error::ConnectionClosed),
            ConnState::Broken => Err(Error::RolledBackIndeterminate),
            ConnState::Idle | ConnState::Leased => match conn.rollback_raw(ctx).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_fatal() => Err(Error::RolledBackIndeterminate),
                Err(e) => {
                    conn.mark_broken();
                    Err(e)
                }
            },
        };
        self.state = TxState::RolledBack;
        self.finish().await;
        res
    }

    /// Hand a leased connection back to the pool.
    async fn finish(&mut self) {
        if let Some(TxConn::Leased(lease)) = self.conn.take() {
            lease.release().await;
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        if let Some(conn) = self.conn.as_mut().and_then(TxConn::get) {
            warn!(connection = conn.id(), "transaction dropped while active");
            conn.mark_broken();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .finish()
    }
}
