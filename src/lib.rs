//! sqlbridge - a connection-pooled, transactional SQL driver adapter.
//!
//! Backends implement the small [`driver`] capability interface; this crate
//! adds pooling, prepared statement caching, transactions with a strict
//! terminal-state machine, forward-only cursors and a process-wide driver
//! registry on top.
//!
//! ```ignore
//! sqlbridge::sqlite::register()?;
//! let pool = sqlbridge::open("sqlite", "sqlite://app.db")?;
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//!
//! let mut tx = pool.begin(&ctx).await?;
//! tx.exec(&ctx, "INSERT INTO users (name) VALUES (?)", &["ada".into()]).await?;
//! tx.commit(&ctx).await?;
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod driver;
pub mod error;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod rows;
pub mod sqlite;
pub mod statement;
pub mod transaction;
pub mod value;


pub use config::PoolConfig;
pub use connection::{ConnState, Connection};
pub use context::{CancelHandle, Context};
pub use driver::{
    Capabilities, DataSource, Driver, DriverConnection, DriverRows, DriverStatement, ExecResult,
    Fetch,
};
pub use error::{Error, Result};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use registry::{connect, drivers, open, open_with, register, Registry};
pub use rows::{Row, RowCursor};
pub use statement::Statement;
pub use transaction::{Transaction, TxState};
pub use value::{FromValue, Nullable, Value};
