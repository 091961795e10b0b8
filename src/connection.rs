//! Connection state machine.
//!
//! A [`Connection`] owns one driver link. Statements, transactions and row
//! cursors derived from it share its [`Link`], so they observe a close, a
//! broken link or the end of a pool lease without borrowing the connection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::Context;
use crate::driver::{
    Capabilities, DataSource, Driver, DriverConnection, DriverRows, DriverStatement, ExecResult,
};
use crate::error::{Error, Result};
use crate::rows::{Row, RowCursor};
use crate::statement::{PreparedHandle, Statement, StatementCache};
use crate::transaction::Transaction;
use crate::value::Value;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Connection state
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Owned by the pool, waiting for a lease.
    Idle = 0,
    /// Owned by exactly one caller.
    Leased = 1,
    Closed = 2,
    /// Unusable; never returned to the idle set.
    Broken = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Idle,
            1 => ConnState::Leased,
            2 => ConnState::Closed,
            _ => ConnState::Broken,
        }
    }
}

/// A driver resource whose owner went away without closing it.
pub(crate) enum Deferred {
    Statement(Box<dyn DriverStatement>),
    Rows(Box<dyn DriverRows>),
}

/// State shared between a connection and the objects derived from it.
pub(crate) struct Link {
    id: u64,
    state: AtomicU8,
    /// Bumped when a lease ends; handles from an older lease are stale.
    epoch: AtomicU64,
    /// Closed by the connection before its next round-trip
    deferred: Mutex<Vec<Deferred>>,
}

impl Link {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnState::Leased as u8),
            epoch: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Queue `resource` to be closed by the owning connection. Dropped
    /// right away once the connection is closed.
    pub(crate) fn defer_close(&self, resource: Deferred) {
        if self.state() != ConnState::Closed {
            self.deferred.lock().push(resource);
        }
    }

    fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(&mut *self.deferred.lock())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Flag the link broken unless it is already closed.
    pub(crate) fn mark_broken(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (ConnState::from_u8(s) != ConnState::Closed).then_some(ConnState::Broken as u8)
        });
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            ConnState::Closed => Err(Error::ConnectionClosed),
            ConnState::Broken => Err(Error::ConnectionBroken),
            ConnState::Idle | ConnState::Leased => Ok(()),
        }
    }

    /// Usable and still within the lease that produced `epoch`.
    pub(crate) fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.epoch() != epoch {
            return Err(Error::ConnectionClosed);
        }
        self.ensure_usable()
    }

    /// Run one server round-trip under `ctx`.
    ///
    /// A fatal error, including cancellation, flags the link broken so the
    /// connection is never reused in an unknown protocol state.
    pub(crate) async fn run<T, F>(&self, ctx: &Context, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_usable()?;
        let res = ctx.run(fut).await;
        if let Err(e) = &res {
            if e.is_fatal() {
                warn!(connection = self.id, error = %e, "connection flagged broken");
                self.mark_broken();
            }
        }
        res
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .field("deferred", &self.deferred.lock().len())
            .finish()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One physical link to the database server.
///
/// Not safe for concurrent use by two logical callers; the pool enforces
/// this by leasing connections exclusively.
pub struct Connection {
    raw: Box<dyn DriverConnection>,
    link: Arc<Link>,
    capabilities: Capabilities,
    statements: StatementCache,
    /// Statements handed out during the current lease
    handed_out: Vec<Weak<PreparedHandle>>,
    log_queries: bool,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    /// Open a standalone connection outside of any pool.
    pub async fn connect(
        ctx: &Context,
        driver: &dyn Driver,
        source: &DataSource,
        statement_cache_capacity: usize,
    ) -> Result<Self> {
        let raw = ctx.run(driver.connect(source)).await?;
        Ok(Self::new(raw, driver.capabilities(), statement_cache_capacity))
    }

    pub(crate) fn new(
        raw: Box<dyn DriverConnection>,
        capabilities: Capabilities,
        statement_cache_capacity: usize,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        debug!(connection = id, "opened connection");
        Self {
            raw,
            link: Arc::new(Link::new(id)),
            capabilities,
            statements: StatementCache::new(statement_cache_capacity),
            handed_out: Vec::new(),
            log_queries: false,
            created_at: now,
            last_used: now,
        }
    }

    /// Log every prepare, exec and query at debug level.
    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    pub fn logs_queries(&self) -> bool {
        self.log_queries
    }

    pub fn id(&self) -> u64 {
        self.link.id()
    }

    pub fn state(&self) -> ConnState {
        self.link.state()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Neither closed nor broken.
    pub fn is_usable(&self) -> bool {
        self.link.ensure_usable().is_ok()
    }

    /// Flag the connection broken; the pool closes it on release.
    pub fn mark_broken(&mut self) {
        self.link.mark_broken();
    }

    /// Number of server-side statements held in the cache.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Prepare a statement, reusing the cached server-side handle when the
    /// same query was prepared before on this connection.
    pub async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<Statement> {
        self.link.ensure_usable()?;
        self.touch();
        self.close_deferred().await;
        if self.log_queries {
            debug!(connection = self.id(), query, "prepare");
        }

        if let Some(handle) = self.statements.get_and_touch(query) {
            return Ok(self.hand_out(handle));
        }

        let raw = self.link.run(ctx, self.raw.prepare(query)).await?;
        let cached = self.statements.is_enabled();
        let handle = Arc::new(PreparedHandle::new(
            self.statements.next_statement_id(),
            query,
            raw,
            cached,
            Arc::clone(&self.link),
        ));

        if cached {
            if let Some(evicted) = self.statements.insert(query.to_string(), Arc::clone(&handle)) {
                debug!(connection = self.id(), query = %evicted.query(), "evicted cached statement");
                // Closed now if unreferenced, else when its last holder lets go
                evicted.evict();
                drop(evicted);
                self.close_deferred().await;
            }
        }

        Ok(self.hand_out(handle))
    }

    fn hand_out(&mut self, handle: Arc<PreparedHandle>) -> Statement {
        self.handed_out.retain(|h| h.strong_count() > 0);
        self.handed_out.push(Arc::downgrade(&handle));
        Statement::new(handle, Arc::clone(&self.link), self.log_queries)
    }

    /// Retire the statements of the current lease that the cache does not
    /// own. Their server-side handles are closed on the next round-trip.
    pub(crate) fn end_lease(&mut self) {
        for handle in self.handed_out.drain(..).filter_map(|h| h.upgrade()) {
            if !handle.is_cached() {
                handle.retire();
            }
        }
    }

    /// Close driver statements and row streams whose owners were dropped.
    pub(crate) async fn close_deferred(&mut self) {
        let deferred = self.link.take_deferred();
        if deferred.is_empty() || !self.is_usable() {
            return;
        }
        for resource in deferred {
            let res = match resource {
                Deferred::Statement(mut stmt) => stmt.close().await,
                Deferred::Rows(mut rows) => rows.close().await,
            };
            if let Err(e) = res {
                if e.is_fatal() {
                    self.link.mark_broken();
                }
                debug!(connection = self.id(), error = %e, "failed to close deferred resource");
            }
        }
    }

    /// Execute a query that returns no rows.
    ///
    /// Without the direct-exec capability the query is prepared, run once
    /// and its handle closed.
    pub async fn exec(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.link.ensure_usable()?;
        self.touch();
        self.close_deferred().await;
        if self.log_queries {
            debug!(connection = self.id(), query, args = args.len(), "exec");
        }

        if self.capabilities.direct_exec {
            return self.link.run(ctx, self.raw.exec_direct(query, args)).await;
        }

        let mut stmt = self.link.run(ctx, self.raw.prepare(query)).await?;
        let res = match check_arity(stmt.as_ref(), args) {
            Ok(()) => self.link.run(ctx, stmt.exec(args)).await,
            Err(e) => Err(e),
        };
        self.discard_statement(stmt).await;
        res
    }

    /// Execute a query that returns rows.
    pub async fn query(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<RowCursor> {
        self.link.ensure_usable()?;
        self.touch();
        self.close_deferred().await;
        if self.log_queries {
            debug!(connection = self.id(), query, args = args.len(), "query");
        }

        let rows = if self.capabilities.direct_query {
            self.link.run(ctx, self.raw.query_direct(query, args)).await?
        } else {
            let mut stmt = self.link.run(ctx, self.raw.prepare(query)).await?;
            let res = match check_arity(stmt.as_ref(), args) {
                Ok(()) => self.link.run(ctx, stmt.query(args)).await,
                Err(e) => Err(e),
            };
            // Rows stay valid after their statement is closed
            self.discard_statement(stmt).await;
            res?
        };

        Ok(RowCursor::new(rows, Arc::clone(&self.link), ctx.clone()))
    }

    /// Run a query and return its first row, if any. The rest is discarded.
    pub async fn query_row(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        self.query(ctx, query, args).await?.first_row().await
    }

    async fn discard_statement(&mut self, mut stmt: Box<dyn DriverStatement>) {
        if !self.is_usable() {
            return;
        }
        if let Err(e) = stmt.close().await {
            if e.is_fatal() {
                self.link.mark_broken();
            }
            debug!(connection = self.id(), error = %e, "failed to close one-shot statement");
        }
    }

    /// Run a multi-statement script.
    pub async fn exec_batch(&mut self, ctx: &Context, script: &str) -> Result<()> {
        if !self.capabilities.batch {
            return Err(Error::Unsupported("batch execution"));
        }
        self.touch();
        self.close_deferred().await;
        self.link.run(ctx, self.raw.exec_batch(script)).await
    }

    /// Start a transaction on this connection.
    pub async fn begin(&mut self, ctx: &Context) -> Result<Transaction<'_>> {
        self.begin_raw(ctx).await?;
        Ok(Transaction::borrowed(self))
    }

    pub(crate) async fn begin_raw(&mut self, ctx: &Context) -> Result<()> {
        self.touch();
        self.close_deferred().await;
        self.link.run(ctx, self.raw.begin()).await
    }

    pub(crate) async fn commit_raw(&mut self, ctx: &Context) -> Result<()> {
        self.touch();
        self.link.run(ctx, self.raw.commit()).await
    }

    pub(crate) async fn rollback_raw(&mut self, ctx: &Context) -> Result<()> {
        self.touch();
        self.link.run(ctx, self.raw.rollback()).await
    }

    /// Verify the link is alive.
    pub async fn ping(&mut self, ctx: &Context) -> Result<()> {
        self.link.run(ctx, self.raw.ping()).await
    }

    /// Release the server session. Closing twice is a no-op.
    ///
    /// Statements, transactions and cursors derived from this connection
    /// fail with `ConnectionClosed` afterwards.
    pub async fn close(&mut self) -> Result<()> {
        if self.link.state() == ConnState::Closed {
            return Ok(());
        }
        let was_usable = self.is_usable();

        self.end_lease();
        for handle in self.statements.drain() {
            handle.evict();
            handle.retire();
        }
        if was_usable {
            self.close_deferred().await;
        }
        self.link.set_state(ConnState::Closed);
        drop(self.link.take_deferred());

        let res = self.raw.close().await;
        debug!(connection = self.id(), "closed connection");
        // A broken link has nothing left to release cleanly
        if was_usable {
            res
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}

pub(crate) fn check_arity(stmt: &dyn DriverStatement, args: &[Value]) -> Result<()> {
    match stmt.num_input() {
        Some(expected) if expected != args.len() => Err(Error::ArgumentCount {
            expected,
            given: args.len(),
        }),
        _ => Ok(()),
    }
}
