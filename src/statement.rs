//! Prepared statements and the per-connection statement cache.
//!
//! This module provides:
//! - `Statement`: a caller's handle to a prepared query
//! - `StatementCache`: O(1) LRU cache of server-side handles per connection

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{Deferred, Link};
use crate::context::Context;
use crate::driver::{DriverStatement, ExecResult};
use crate::error::{Error, Result};
use crate::rows::{Row, RowCursor};
use crate::value::Value;

// ============================================================================
// Prepared handle
// ============================================================================

/// A server-side prepared statement shared by the cache and the
/// `Statement`s handed out for it.
///
/// Dropping the last reference queues the driver statement for closing on
/// its connection.
pub(crate) struct PreparedHandle {
    id: u64,
    query: String,
    num_input: Option<usize>,
    /// Whether the connection's cache owns the server-side lifetime
    cached: AtomicBool,
    /// None once retired
    raw: Mutex<Option<Box<dyn DriverStatement>>>,
    link: Arc<Link>,
}

impl PreparedHandle {
    pub(crate) fn new(
        id: u64,
        query: &str,
        raw: Box<dyn DriverStatement>,
        cached: bool,
        link: Arc<Link>,
    ) -> Self {
        Self {
            id,
            query: query.to_string(),
            num_input: raw.num_input(),
            cached: AtomicBool::new(cached),
            raw: Mutex::new(Some(raw)),
            link,
        }
    }

    pub(crate) fn query(&self) -> &str {
        &self.query
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    /// The cache gave the handle up.
    pub(crate) fn evict(&self) {
        self.cached.store(false, Ordering::Release);
    }

    /// Hand the driver statement to the connection for closing. Skipped
    /// while an execution holds it; the drop of the last reference retires
    /// it then.
    pub(crate) fn retire(&self) {
        if let Ok(mut raw) = self.raw.try_lock() {
            if let Some(raw) = raw.take() {
                self.link.defer_close(Deferred::Statement(raw));
            }
        }
    }
}

impl Drop for PreparedHandle {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.get_mut().take() {
            debug!(connection = self.link.id(), statement = self.id, "statement released");
            self.link.defer_close(Deferred::Statement(raw));
        }
    }
}

// ============================================================================
// Statement
// ============================================================================

/// A prepared, parameterized query bound to one connection.
///
/// Valid until it is closed, its connection is closed, or the pool lease it
/// was prepared under ends.
pub struct Statement {
    handle: Arc<PreparedHandle>,
    link: Arc<Link>,
    epoch: u64,
    closed: bool,
    log_queries: bool,
}

impl Statement {
    pub(crate) fn new(handle: Arc<PreparedHandle>, link: Arc<Link>, log_queries: bool) -> Self {
        let epoch = link.epoch();
        Self {
            handle,
            link,
            epoch,
            closed: false,
            log_queries,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.handle.query
    }

    /// Expected positional parameter count, or `None` when unknown; the
    /// driver then validates the arguments at execution time.
    pub fn num_input(&self) -> Option<usize> {
        self.handle.num_input
    }

    /// Checks done without contacting the server.
    fn check(&self, args: &[Value]) -> Result<()> {
        if self.closed {
            return Err(Error::StatementClosed);
        }
        self.link.ensure_current(self.epoch)?;
        match self.handle.num_input {
            Some(expected) if expected != args.len() => Err(Error::ArgumentCount {
                expected,
                given: args.len(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        self.check(args)?;
        if self.log_queries {
            debug!(connection = self.link.id(), query = %self.handle.query, args = args.len(), "exec");
        }
        let mut guard = self.handle.raw.lock().await;
        let raw = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        self.link.run(ctx, raw.exec(args)).await
    }

    pub async fn query(&self, ctx: &Context, args: &[Value]) -> Result<RowCursor> {
        self.check(args)?;
        if self.log_queries {
            debug!(connection = self.link.id(), query = %self.handle.query, args = args.len(), "query");
        }
        let mut guard = self.handle.raw.lock().await;
        let raw = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        let rows = self.link.run(ctx, raw.query(args)).await?;
        Ok(RowCursor::new(rows, Arc::clone(&self.link), ctx.clone()))
    }

    /// Run the statement and return its first row, if any.
    pub async fn query_row(&self, ctx: &Context, args: &[Value]) -> Result<Option<Row>> {
        self.query(ctx, args).await?.first_row().await
    }

    /// Close the statement. Cursors it produced remain readable.
    ///
    /// A cached server-side handle stays with its connection for reuse;
    /// an uncached one is released here.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // A stale statement must not touch a connection leased to someone else
        if self.handle.is_cached() || self.link.ensure_current(self.epoch).is_err() {
            return Ok(());
        }
        let raw = self.handle.raw.lock().await.take();
        match raw {
            Some(mut raw) => raw.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.handle.id)
            .field("query", &self.handle.query)
            .field("num_input", &self.handle.num_input)
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements.
///
/// Each connection maintains its own cache to avoid re-preparing frequently
/// executed queries. Handles are stored as `Arc` so a cache hit costs a
/// reference count increment.
pub(crate) struct StatementCache {
    /// query text → handle; `None` when caching is disabled
    cache: Option<LruCache<String, Arc<PreparedHandle>>>,
    next_id: u64,
}

impl StatementCache {
    /// Create a cache holding up to `capacity` statements; 0 disables it.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            next_id: 0,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Get a handle and mark it recently used.
    pub(crate) fn get_and_touch(&mut self, query: &str) -> Option<Arc<PreparedHandle>> {
        self.cache.as_mut()?.get(query).map(Arc::clone)
    }

    /// Insert a handle, returning the least recently used one if the cache
    /// was full.
    pub(crate) fn insert(
        &mut self,
        query: String,
        handle: Arc<PreparedHandle>,
    ) -> Option<Arc<PreparedHandle>> {
        let cache = self.cache.as_mut()?;
        match cache.push(query, handle) {
            // `push` also hands back the old value when replacing the same key
            Some((_, evicted)) => Some(evicted),
            None => None,
        }
    }

    pub(crate) fn next_statement_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    /// Remove every handle, least recently used first.
    pub(crate) fn drain(&mut self) -> Vec<Arc<PreparedHandle>> {
        let Some(cache) = self.cache.as_mut() else {
            return Vec::new();
        };
        let mut handles = Vec::with_capacity(cache.len());
        while let Some((_, handle)) = cache.pop_lru() {
            handles.push(handle);
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::driver::DriverRows;

    struct NoopStatement(Option<usize>);

    #[async_trait]
    impl DriverStatement for NoopStatement {
        fn num_input(&self) -> Option<usize> {
            self.0
        }

        async fn exec(&mut self, _args: &[Value]) -> Result<ExecResult> {
            Ok(ExecResult::default())
        }

        async fn query(&mut self, _args: &[Value]) -> Result<Box<dyn DriverRows>> {
            Err(Error::Unsupported("query"))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn handle(cache: &mut StatementCache, query: &str) -> Arc<PreparedHandle> {
        let id = cache.next_statement_id();
        let link = Arc::new(Link::new(id));
        Arc::new(PreparedHandle::new(
            id,
            query,
            Box::new(NoopStatement(Some(0))),
            true,
            link,
        ))
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert_eq!(cache.len(), 0);

        let h = handle(&mut cache, "SELECT 1");
        assert!(cache.insert("SELECT 1".to_string(), h).is_none());
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.get_and_touch("SELECT 1").unwrap().query(), "SELECT 1");
        assert!(cache.get_and_touch("SELECT 2").is_none());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);

        let h1 = handle(&mut cache, "q1");
        let h2 = handle(&mut cache, "q2");
        cache.insert("q1".to_string(), h1);
        cache.insert("q2".to_string(), h2);

        // Access q1 to make it recently used
        cache.get_and_touch("q1");

        let h3 = handle(&mut cache, "q3");
        let evicted = cache.insert("q3".to_string(), h3).unwrap();

        assert_eq!(evicted.query(), "q2");
        assert!(cache.get_and_touch("q1").is_some());
        assert!(cache.get_and_touch("q2").is_none());
        assert!(cache.get_and_touch("q3").is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = StatementCache::new(0);
        assert!(!cache.is_enabled());
        let h = handle(&mut cache, "q1");
        assert!(cache.insert("q1".to_string(), h).is_none());
        assert!(cache.get_and_touch("q1").is_none());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn test_unique_statement_ids() {
        let mut cache = StatementCache::new(10);
        let ids: std::collections::HashSet<u64> =
            (0..10).map(|_| cache.next_statement_id()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_drain_empties_cache() {
        let mut cache = StatementCache::new(4);
        for q in ["a", "b", "c"] {
            let h = handle(&mut cache, q);
            cache.insert(q.to_string(), h);
        }
        let drained = cache.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(cache.len(), 0);
    }
}
