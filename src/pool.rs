//! Bounded connection pool.
//!
//! This module provides:
//! - `Pool`: a cloneable handle to a set of reusable connections
//! - `PooledConnection`: an exclusive lease, returned to the pool on release or drop
//! - `PoolStats`: point-in-time counters
//!
//! Lease slots are semaphore permits, so at most `max_open` connections are
//! ever leased or being created at once. A new connection is only opened when
//! the idle set is empty, which keeps `leased + idle <= max_open`.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnState, Connection};
use crate::context::Context;
use crate::driver::{Capabilities, DataSource, Driver, ExecResult};
use crate::error::{Error, Result};
use crate::rows::{Row, RowCursor};
use crate::statement::Statement;
use crate::transaction::Transaction;
use crate::value::Value;

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections leased plus idle, including ones being opened.
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
    /// Acquires that found no free slot and had to wait.
    pub wait_count: u64,
    pub max_lifetime_closed: u64,
    pub max_idle_closed: u64,
    pub idle_timeout_closed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Lifetime,
    IdleTimeout,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection leased from the pool.
///
/// The lease ends with [`release`](Self::release) or when it is dropped.
/// Statements prepared during the lease stop working once it ends.
pub struct PooledConnection {
    /// The leased connection (None once handed back)
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    /// Lease slot, freed after the connection is handed back
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The underlying connection.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(Connection::id)
    }

    pub fn state(&self) -> ConnState {
        self.conn
            .as_ref()
            .map(Connection::state)
            .unwrap_or(ConnState::Closed)
    }

    /// Check if the connection can still be used.
    pub fn is_usable(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_usable)
    }

    /// Flag the connection broken so it is closed when the lease ends.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }

    pub async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<Statement> {
        self.connection()?.prepare(ctx, query).await
    }

    pub async fn exec(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.connection()?.exec(ctx, query, args).await
    }

    pub async fn query(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<RowCursor> {
        self.connection()?.query(ctx, query, args).await
    }

    pub async fn query_row(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        self.connection()?.query_row(ctx, query, args).await
    }

    pub async fn exec_batch(&mut self, ctx: &Context, script: &str) -> Result<()> {
        self.connection()?.exec_batch(ctx, script).await
    }

    pub async fn begin(&mut self, ctx: &Context) -> Result<Transaction<'_>> {
        self.connection()?.begin(ctx).await
    }

    pub async fn ping(&mut self, ctx: &Context) -> Result<()> {
        self.connection()?.ping(ctx).await
    }

    /// Hand the connection back to the pool.
    ///
    /// Unlike dropping the lease, a connection that cannot be reused is
    /// closed before the lease slot is freed.
    pub async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.end_lease();
            conn.close_deferred().await;
            if let Some(mut discarded) = self.pool.put_back(conn) {
                close_quietly(&mut discarded).await;
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(discarded) = self.pool.put_back(conn) {
                spawn_close(discarded);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

async fn close_quietly(conn: &mut Connection) {
    if let Err(e) = conn.close().await {
        debug!(connection = conn.id(), error = %e, "error closing connection");
    }
}

/// Close `conn` on the runtime if there is one; otherwise it is dropped.
fn spawn_close(mut conn: Connection) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { close_quietly(&mut conn).await });
        }
        Err(_) => debug!(connection = conn.id(), "no runtime to close connection, dropping it"),
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

#[derive(Default)]
struct PoolState {
    /// Most recently released at the back
    idle: VecDeque<Connection>,
    /// Leased plus idle, including connections being opened
    open: usize,
    closed: bool,
    wait_count: u64,
    max_lifetime_closed: u64,
    max_idle_closed: u64,
    idle_timeout_closed: u64,
}

/// One counted entry of `PoolState::open` held by an acquire in progress.
///
/// Dropped without [`keep`](Self::keep) or [`expire`](Self::expire), for
/// instance when the acquire future is cancelled mid-connect, it gives the
/// entry back.
struct Reservation<'a> {
    state: &'a Mutex<PoolState>,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(state: &'a Mutex<PoolState>) -> Self {
        Self { state, armed: true }
    }

    /// The connection was handed out.
    fn keep(mut self) {
        self.armed = false;
    }

    /// The connection is being closed for age.
    fn expire(mut self, expiry: Expiry) {
        self.armed = false;
        self.state.lock().forget(Some(expiry));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().forget(None);
        }
    }
}

/// A deadline hit while acquiring means the pool could not serve in time.
fn exhausted(err: Error, timeout: Duration) -> Error {
    match err {
        Error::DeadlineExceeded => Error::PoolExhausted(timeout),
        other => other,
    }
}

impl PoolState {
    /// Forget one open connection that is about to be closed.
    fn forget(&mut self, expiry: Option<Expiry>) {
        self.open = self.open.saturating_sub(1);
        match expiry {
            Some(Expiry::Lifetime) => self.max_lifetime_closed += 1,
            Some(Expiry::IdleTimeout) => self.idle_timeout_closed += 1,
            None => {}
        }
    }
}

struct PoolInner {
    driver: Arc<dyn Driver>,
    source: DataSource,
    config: PoolConfig,
    /// Read once from the driver
    capabilities: Capabilities,
    /// Limits leased connections to `max_open`
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    /// Stops the reaper
    shutdown: watch::Sender<bool>,
}

impl PoolInner {
    async fn open_connection(&self, ctx: &Context) -> Result<Connection> {
        let raw = ctx.run(self.driver.connect(&self.source)).await?;
        Ok(Connection::new(
            raw,
            self.capabilities,
            self.config.statement_cache_capacity,
        )
        .log_queries(self.config.log_queries))
    }

    fn expiry(&self, conn: &Connection) -> Option<Expiry> {
        if self
            .config
            .max_lifetime
            .is_some_and(|lifetime| conn.age() >= lifetime)
        {
            return Some(Expiry::Lifetime);
        }
        if self
            .config
            .idle_timeout
            .is_some_and(|timeout| conn.last_used().elapsed() >= timeout)
        {
            return Some(Expiry::IdleTimeout);
        }
        None
    }

    /// End a lease. Returns the connection when it must be closed instead
    /// of kept idle.
    fn put_back(&self, mut conn: Connection) -> Option<Connection> {
        conn.end_lease();
        conn.link().bump_epoch();
        conn.touch();

        let mut state = self.state.lock();
        let reason = if state.closed {
            Some("pool closed")
        } else if !conn.is_usable() {
            Some("connection unusable")
        } else if self.expiry(&conn) == Some(Expiry::Lifetime) {
            state.max_lifetime_closed += 1;
            Some("max lifetime reached")
        } else if state.idle.len() >= self.config.max_idle {
            state.max_idle_closed += 1;
            Some("idle set full")
        } else {
            None
        };

        match reason {
            None => {
                conn.link().set_state(ConnState::Idle);
                debug!(connection = conn.id(), idle = state.idle.len() + 1, "connection returned to pool");
                state.idle.push_back(conn);
                None
            }
            Some(reason) => {
                state.open = state.open.saturating_sub(1);
                debug!(connection = conn.id(), reason, "discarding released connection");
                Some(conn)
            }
        }
    }

    /// Close idle connections past their lifetime or idle timeout.
    async fn reap(&self) -> usize {
        let expired: Vec<Connection> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(conn) = state.idle.pop_front() {
                match self.expiry(&conn) {
                    Some(expiry) => {
                        state.forget(Some(expiry));
                        expired.push(conn);
                    }
                    None => kept.push_back(conn),
                }
            }
            state.idle = kept;
            expired
        };

        let reaped = expired.len();
        for mut conn in expired {
            close_quietly(&mut conn).await;
        }
        if reaped > 0 {
            info!(source = %self.source, reaped, "reaped idle connections");
        }
        reaped
    }
}

async fn run_reaper(
    pool: Weak<PoolInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                inner.reap().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("reaper stopped");
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A pool of connections to one data source.
///
/// Cloning is cheap; all clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool without opening any connection.
    ///
    /// Starts the background reaper when `reap_interval` is set, which
    /// requires a running tokio runtime.
    pub fn open(
        driver: Arc<dyn Driver>,
        source: impl Into<DataSource>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            capabilities: driver.capabilities(),
            driver,
            source: source.into(),
            semaphore: Arc::new(Semaphore::new(config.max_open)),
            config,
            state: Mutex::new(PoolState::default()),
            shutdown,
        });

        if let Some(interval) = inner.config.reap_interval {
            let handle = Handle::try_current()
                .map_err(|_| Error::Config("reap_interval requires a tokio runtime".to_string()))?;
            handle.spawn(run_reaper(Arc::downgrade(&inner), interval, shutdown_rx));
        }

        debug!(source = %inner.source, max_open = inner.config.max_open, "pool opened");
        Ok(Self { inner })
    }

    /// Create a pool and pre-create `min_idle` connections.
    pub async fn connect(
        driver: Arc<dyn Driver>,
        source: impl Into<DataSource>,
        config: PoolConfig,
    ) -> Result<Self> {
        let pool = Self::open(driver, source, config)?;
        let ctx = Context::with_timeout(pool.inner.config.acquire_timeout);

        for _ in 0..pool.inner.config.min_idle {
            pool.inner.state.lock().open += 1;
            let slot = Reservation::new(&pool.inner.state);
            match pool.inner.open_connection(&ctx).await {
                Ok(conn) => {
                    slot.keep();
                    conn.link().set_state(ConnState::Idle);
                    pool.inner.state.lock().idle.push_back(conn);
                }
                Err(e) => {
                    drop(slot);
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn data_source(&self) -> &DataSource {
        &self.inner.source
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Lease a connection, waiting at most the configured `acquire_timeout`.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledConnection> {
        self.acquire_timeout(ctx, self.inner.config.acquire_timeout)
            .await
    }

    /// Lease a connection, waiting at most `timeout` or until the context's
    /// deadline, whichever comes first.
    ///
    /// Idle connections are reused most recently released first. Expired
    /// ones are closed and replaced along the way.
    pub async fn acquire_timeout(&self, ctx: &Context, timeout: Duration) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let wait = ctx.clone().timeout(timeout);
        let permit = self.wait_for_slot(ctx, &wait, timeout).await?;

        loop {
            let idle = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                let idle = state.idle.pop_back();
                if idle.is_none() {
                    // Reserve the slot before connecting
                    state.open += 1;
                }
                idle
            };
            let slot = Reservation::new(&self.inner.state);

            let Some(mut conn) = idle else {
                let conn = self
                    .inner
                    .open_connection(&wait)
                    .await
                    .map_err(|e| exhausted(e, timeout))?;
                slot.keep();
                return Ok(self.lease(conn, permit));
            };

            if let Some(expiry) = self.inner.expiry(&conn) {
                slot.expire(expiry);
                debug!(connection = conn.id(), ?expiry, "closing expired idle connection");
                close_quietly(&mut conn).await;
                continue;
            }

            conn.link().set_state(ConnState::Leased);
            if self.inner.config.test_on_acquire {
                if let Err(e) = conn.ping(&wait).await {
                    drop(slot);
                    debug!(connection = conn.id(), error = %e, "idle connection failed ping");
                    close_quietly(&mut conn).await;
                    if matches!(e, Error::Cancelled | Error::DeadlineExceeded) {
                        return Err(exhausted(e, timeout));
                    }
                    continue;
                }
            }

            slot.keep();
            debug!(connection = conn.id(), "reusing idle connection");
            return Ok(self.lease(conn, permit));
        }
    }

    async fn wait_for_slot(
        &self,
        ctx: &Context,
        wait: &Context,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.inner.state.lock().wait_count += 1;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = wait.expired() => Err(Error::PoolExhausted(timeout)),
            permit = semaphore.acquire_owned() => permit.map_err(|_| Error::PoolClosed),
        }
    }

    fn lease(&self, conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        conn.link().set_state(ConnState::Leased);
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Execute a query that returns no rows on a pooled connection.
    pub async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        let mut conn = self.acquire(ctx).await?;
        let res = conn.exec(ctx, query, args).await;
        conn.release().await;
        res
    }

    /// Execute a query on a pooled connection.
    ///
    /// The cursor keeps the connection leased until it is exhausted or closed.
    pub async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<RowCursor> {
        let mut conn = self.acquire(ctx).await?;
        match conn.query(ctx, query, args).await {
            Ok(rows) => Ok(rows.hold_lease(conn)),
            Err(e) => {
                conn.release().await;
                Err(e)
            }
        }
    }

    /// Run a query on a pooled connection and return its first row, if any.
    pub async fn query_row(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        let mut conn = self.acquire(ctx).await?;
        let res = conn.query_row(ctx, query, args).await;
        conn.release().await;
        res
    }

    /// Begin a transaction that owns its lease until commit or rollback.
    pub async fn begin(&self, ctx: &Context) -> Result<Transaction<'static>> {
        let mut conn = self.acquire(ctx).await?;
        if let Err(e) = conn.connection()?.begin_raw(ctx).await {
            conn.release().await;
            return Err(e);
        }
        Ok(Transaction::leased(conn))
    }

    /// Verify a connection to the data source can be leased and is alive.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let res = conn.ping(ctx).await;
        conn.release().await;
        res
    }

    /// Run one reaper pass now, returning the number of connections closed.
    pub async fn reap(&self) -> usize {
        self.inner.reap().await
    }

    /// Close the pool.
    ///
    /// Waiting acquires fail with `PoolClosed`, idle connections are closed
    /// now and leased ones when they are released. Closing twice is a no-op.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len());
            idle
        };

        self.inner.semaphore.close();
        self.inner.shutdown.send_replace(true);

        let closed = idle.len();
        for mut conn in idle {
            close_quietly(&mut conn).await;
        }

        let leased = self.inner.state.lock().open;
        if leased > 0 {
            warn!(source = %self.inner.source, leased, "pool closed with connections still leased");
        }
        info!(source = %self.inner.source, closed, "pool closed");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            leased: state.open.saturating_sub(state.idle.len()),
            wait_count: state.wait_count,
            max_lifetime_closed: state.max_lifetime_closed,
            max_idle_closed: state.max_idle_closed,
            idle_timeout_closed: state.idle_timeout_closed,
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("source", &self.inner.source)
            .field("stats", &self.stats())
            .finish()
    }
}
