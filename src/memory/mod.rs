//! Scripted in-memory backend.
//!
//! A [`MemoryServer`] answers registered queries with canned results and
//! records everything its connections do, which makes pool and transaction
//! behavior observable without a real database. It can also misbehave on
//! demand: refuse connections, drop every live session, slow queries down or
//! reject commits.
//!
//! ```ignore
//! let server = MemoryServer::new();
//! server.on_query("SELECT name FROM users WHERE id = ?", &["name"], vec![vec![Value::from("ada")]]);
//! let pool = Pool::open(Arc::new(MemoryDriver::new(server.clone())), "memory", PoolConfig::new())?;
//! ```

mod connection;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::driver::{Capabilities, DataSource, Driver, DriverConnection, ExecResult};
use crate::error::{Error, Result};
use crate::value::Value;

pub use connection::{MemoryConnection, MemoryRows, MemoryStatement};

/// Name the backend registers under.
pub const DRIVER_NAME: &str = "memory";

/// One operation observed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect { conn: u64 },
    Prepare { conn: u64, query: String },
    Exec { conn: u64, query: String, args: Vec<Value> },
    Query { conn: u64, query: String, args: Vec<Value> },
    Batch { conn: u64, script: String },
    CloseStatement { conn: u64, query: String },
    CloseRows { conn: u64 },
    Begin { conn: u64 },
    Commit { conn: u64 },
    Rollback { conn: u64 },
    Ping { conn: u64 },
    Close { conn: u64 },
}

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Exec(ExecResult),
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Error {
        code: Option<String>,
        message: String,
    },
}

#[derive(Default)]
struct ServerState {
    replies: HashMap<String, Reply>,
    unknown_arity: HashSet<String>,
    delays: HashMap<String, Duration>,
    connect_delay: Option<Duration>,
    journal: Vec<Event>,
    /// Bumped by `sever`; sessions from an older generation are dead
    generation: u64,
    connect_failures: usize,
    commit_failure: Option<String>,
    next_conn: u64,
    connects: u64,
    live: usize,
    peak_live: usize,
}

/// A scripted database server shared by every connection made to it.
///
/// Cloning is cheap; clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `query` with an exec result.
    pub fn on_exec(&self, query: &str, result: ExecResult) {
        self.state
            .lock()
            .replies
            .insert(query.to_string(), Reply::Exec(result));
    }

    /// Answer `query` with a row set.
    pub fn on_query(&self, query: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.state
            .lock()
            .replies
            .insert(query.to_string(), Reply::Rows { columns, rows });
    }

    /// Fail every execution of `query` with a server error.
    pub fn on_error(&self, query: &str, code: Option<&str>, message: &str) {
        self.state.lock().replies.insert(
            query.to_string(),
            Reply::Error {
                code: code.map(str::to_string),
                message: message.to_string(),
            },
        );
    }

    /// Report an unknown parameter count when `query` is prepared.
    pub fn unknown_arity(&self, query: &str) {
        self.state.lock().unknown_arity.insert(query.to_string());
    }

    /// Delay every execution of `query`.
    pub fn delay(&self, query: &str, latency: Duration) {
        self.state
            .lock()
            .delays
            .insert(query.to_string(), latency);
    }

    /// Delay every connection attempt.
    pub fn delay_connects(&self, latency: Duration) {
        self.state.lock().connect_delay = Some(latency);
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().connect_failures = n;
    }

    /// Reject every commit with a server error.
    pub fn fail_commits(&self, message: &str) {
        self.state.lock().commit_failure = Some(message.to_string());
    }

    /// Drop every live session, as if the network went away. Connections
    /// made afterwards work normally.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.live = 0;
    }

    pub fn journal(&self) -> Vec<Event> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Successful connection attempts so far.
    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    /// Sessions currently open on the server.
    pub fn live_connections(&self) -> usize {
        self.state.lock().live
    }

    /// Highest number of simultaneously open sessions seen.
    pub fn peak_connections(&self) -> usize {
        self.state.lock().peak_live
    }

    fn connect(&self) -> Result<(u64, u64)> {
        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory server refused connection",
            )));
        }
        state.next_conn += 1;
        state.connects += 1;
        state.live += 1;
        state.peak_live = state.peak_live.max(state.live);
        let conn = state.next_conn;
        state.journal.push(Event::Connect { conn });
        Ok((conn, state.generation))
    }

    pub(crate) fn record(&self, event: Event) {
        self.state.lock().journal.push(event);
    }

    /// Whether a session from `generation` is still connected.
    pub(crate) fn is_alive(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    pub(crate) fn disconnect(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.live = state.live.saturating_sub(1);
        }
    }

    /// Parameter count of `query`: its `?` placeholders, unless registered
    /// as unknown.
    pub(crate) fn arity(&self, query: &str) -> Option<usize> {
        if self.state.lock().unknown_arity.contains(query) {
            return None;
        }
        Some(query.matches('?').count())
    }

    pub(crate) fn reply(&self, query: &str) -> Option<Reply> {
        self.state.lock().replies.get(query).cloned()
    }

    pub(crate) fn latency(&self, query: &str) -> Option<Duration> {
        self.state.lock().delays.get(query).copied()
    }

    pub(crate) fn connect_delay(&self) -> Option<Duration> {
        self.state.lock().connect_delay
    }

    pub(crate) fn commit_failure(&self) -> Option<String> {
        self.state.lock().commit_failure.clone()
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryServer")
            .field("queries", &state.replies.len())
            .field("live", &state.live)
            .field("connects", &state.connects)
            .finish()
    }
}

/// Driver connecting to a [`MemoryServer`]. The data source is ignored.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    server: MemoryServer,
    capabilities: Capabilities,
}

impl MemoryDriver {
    pub fn new(server: MemoryServer) -> Self {
        Self {
            server,
            capabilities: Capabilities::default(),
        }
    }

    /// Advertise optional features; the server supports all of them.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, _source: &DataSource) -> Result<Box<dyn DriverConnection>> {
        if let Some(latency) = self.server.connect_delay() {
            tokio::time::sleep(latency).await;
        }
        let (id, generation) = self.server.connect()?;
        Ok(Box::new(MemoryConnection::new(
            self.server.clone(),
            id,
            generation,
        )))
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Register a driver for `server` in the process-wide registry as `"memory"`.
pub fn register(server: MemoryServer) -> Result<()> {
    crate::registry::register(DRIVER_NAME, Arc::new(MemoryDriver::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverRows, DriverStatement, Fetch};

    #[test]
    fn test_arity_counts_placeholders() {
        let server = MemoryServer::new();
        assert_eq!(server.arity("SELECT * FROM t WHERE a = ? AND b = ?"), Some(2));
        assert_eq!(server.arity("SELECT 1"), Some(0));
        server.unknown_arity("CALL proc()");
        assert_eq!(server.arity("CALL proc()"), None);
    }

    #[tokio::test]
    async fn test_fail_connects_then_recovers() {
        let server = MemoryServer::new();
        server.fail_connects(1);
        let driver = MemoryDriver::new(server.clone());
        let source = DataSource::new("memory");

        assert!(matches!(driver.connect(&source).await, Err(Error::Io(_))));
        assert!(driver.connect(&source).await.is_ok());
        assert_eq!(server.connects(), 1);
        assert_eq!(server.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_sever_breaks_existing_sessions_only() {
        let server = MemoryServer::new();
        server.on_query("SELECT 1", &["one"], vec![vec![Value::Int(1)]]);
        let driver = MemoryDriver::new(server.clone());
        let source = DataSource::new("memory");

        let mut old = driver.connect(&source).await.unwrap();
        server.sever();
        assert!(matches!(old.ping().await, Err(Error::ConnectionBroken)));

        let mut fresh = driver.connect(&source).await.unwrap();
        let mut stmt = fresh.prepare("SELECT 1").await.unwrap();
        let mut rows = stmt.query(&[]).await.unwrap();
        let mut buf = vec![Value::Null];
        assert_eq!(rows.next(&mut buf).await.unwrap(), Fetch::Row);
        assert_eq!(buf[0], Value::Int(1));
    }

    #[tokio::test]
    async fn test_scripted_error_passes_through() {
        let server = MemoryServer::new();
        server.on_error("INSERT INTO t VALUES (?)", Some("23505"), "duplicate key");
        let driver = MemoryDriver::new(server);
        let mut conn = driver.connect(&DataSource::new("memory")).await.unwrap();

        let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();
        match stmt.exec(&[Value::Int(1)]).await {
            Err(Error::Server { code, message }) => {
                assert_eq!(code.as_deref(), Some("23505"));
                assert_eq!(message, "duplicate key");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }
}
