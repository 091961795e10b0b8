//! Sessions, statements and row streams of the memory backend.

use std::collections::VecDeque;

use async_trait::async_trait;

use super::{Event, MemoryServer, Reply};
use crate::driver::{DriverConnection, DriverRows, DriverStatement, ExecResult, Fetch};
use crate::error::{Error, Result};
use crate::value::Value;

/// Liveness of one session, shared by everything it produced.
#[derive(Debug, Clone)]
struct Session {
    server: MemoryServer,
    conn: u64,
    generation: u64,
}

impl Session {
    fn check(&self) -> Result<()> {
        if self.server.is_alive(self.generation) {
            Ok(())
        } else {
            Err(Error::ConnectionBroken)
        }
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.check()?;
        self.server.record(Event::Exec {
            conn: self.conn,
            query: query.to_string(),
            args: args.to_vec(),
        });
        self.wait(query).await?;
        match self.server.reply(query) {
            Some(Reply::Exec(result)) => Ok(result),
            Some(Reply::Error { code, message }) => Err(Error::Server { code, message }),
            Some(Reply::Rows { .. }) | None => Ok(ExecResult::default()),
        }
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.check()?;
        self.server.record(Event::Query {
            conn: self.conn,
            query: query.to_string(),
            args: args.to_vec(),
        });
        self.wait(query).await?;
        let (columns, rows) = match self.server.reply(query) {
            Some(Reply::Rows { columns, rows }) => (columns, rows),
            Some(Reply::Error { code, message }) => return Err(Error::Server { code, message }),
            Some(Reply::Exec(_)) | None => (Vec::new(), Vec::new()),
        };
        Ok(Box::new(MemoryRows {
            session: self.clone(),
            columns,
            rows: rows.into(),
            closed: false,
        }))
    }

    /// Apply the scripted latency; a session severed meanwhile fails.
    async fn wait(&self, query: &str) -> Result<()> {
        if let Some(latency) = self.server.latency(query) {
            tokio::time::sleep(latency).await;
            self.check()?;
        }
        Ok(())
    }
}

/// One session on a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    session: Session,
    in_transaction: bool,
    closed: bool,
}

impl MemoryConnection {
    pub(crate) fn new(server: MemoryServer, conn: u64, generation: u64) -> Self {
        Self {
            session: Session {
                server,
                conn,
                generation,
            },
            in_transaction: false,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.session.conn
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.session.check()
    }

    fn record(&self, event: Event) {
        self.session.server.record(event);
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn prepare(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.check()?;
        self.record(Event::Prepare {
            conn: self.id(),
            query: query.to_string(),
        });
        Ok(Box::new(MemoryStatement {
            session: self.session.clone(),
            num_input: self.session.server.arity(query),
            query: query.to_string(),
            closed: false,
        }))
    }

    async fn exec_direct(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.check()?;
        self.session.exec(query, args).await
    }

    async fn query_direct(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.check()?;
        self.session.query(query, args).await
    }

    async fn exec_batch(&mut self, script: &str) -> Result<()> {
        self.check()?;
        self.record(Event::Batch {
            conn: self.id(),
            script: script.to_string(),
        });
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.check()?;
        if self.in_transaction {
            return Err(Error::server("there is already a transaction in progress"));
        }
        self.record(Event::Begin { conn: self.id() });
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check()?;
        if !self.in_transaction {
            return Err(Error::server("there is no transaction in progress"));
        }
        if let Some(message) = self.session.server.commit_failure() {
            return Err(Error::server(message));
        }
        self.record(Event::Commit { conn: self.id() });
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check()?;
        self.record(Event::Rollback { conn: self.id() });
        self.in_transaction = false;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.check()?;
        self.record(Event::Ping { conn: self.id() });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.server.disconnect(self.session.generation);
        self.record(Event::Close { conn: self.id() });
        Ok(())
    }
}

/// A prepared statement on a memory session.
#[derive(Debug)]
pub struct MemoryStatement {
    session: Session,
    query: String,
    num_input: Option<usize>,
    closed: bool,
}

impl MemoryStatement {
    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StatementClosed);
        }
        self.session.check()
    }
}

#[async_trait]
impl DriverStatement for MemoryStatement {
    fn num_input(&self) -> Option<usize> {
        self.num_input
    }

    async fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.check()?;
        self.session.exec(&self.query, args).await
    }

    async fn query(&mut self, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.check()?;
        self.session.query(&self.query, args).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.server.record(Event::CloseStatement {
            conn: self.session.conn,
            query: self.query.clone(),
        });
        Ok(())
    }
}

/// Canned rows streamed one at a time.
#[derive(Debug)]
pub struct MemoryRows {
    session: Session,
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    closed: bool,
}

#[async_trait]
impl DriverRows for MemoryRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self, dest: &mut [Value]) -> Result<Fetch> {
        self.session.check()?;
        match self.rows.pop_front() {
            Some(row) => {
                for (slot, value) in dest.iter_mut().zip(row) {
                    *slot = value;
                }
                Ok(Fetch::Row)
            }
            None => Ok(Fetch::EndOfData),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.session.server.record(Event::CloseRows {
                conn: self.session.conn,
            });
        }
        Ok(())
    }
}
