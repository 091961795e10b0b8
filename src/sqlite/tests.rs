//! Tests for SQLite driver.

use std::sync::Arc;

use super::*;
use crate::config::PoolConfig;
use crate::context::Context;
use crate::driver::Fetch;
use crate::error::Error;
use crate::pool::Pool;
use crate::transaction::TxState;
use crate::value::Value;

/// A pool over a private in-memory database. One connection, so every
/// lease sees the same data.
fn memory_pool() -> Pool {
    Pool::open(
        Arc::new(SqliteDriver),
        "sqlite::memory:",
        PoolConfig::new().max_open(1).max_idle(1),
    )
    .unwrap()
}

/// A pool over an in-memory database shared by all its connections.
fn shared_pool(name: &str, max_open: usize) -> Pool {
    Pool::open(
        Arc::new(SqliteDriver),
        format!("file:{name}?mode=memory&cache=shared"),
        PoolConfig::new().max_open(max_open).max_idle(max_open),
    )
    .unwrap()
}

#[test]
fn test_database_path() {
    assert_eq!(database_path("sqlite::memory:"), MEMORY);
    assert_eq!(database_path(":memory:"), MEMORY);
    assert_eq!(database_path(""), MEMORY);
    assert_eq!(database_path("sqlite://data/app.db"), "data/app.db");
    assert_eq!(database_path("sqlite:app.db"), "app.db");
    assert_eq!(database_path("/var/lib/app.db"), "/var/lib/app.db");
}

#[tokio::test]
async fn test_connection_open_memory() {
    let mut conn = SqliteConnection::open(MEMORY).await.unwrap();
    assert!(!conn.is_closed());
    conn.ping().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());
    assert!(matches!(conn.ping().await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_execute_and_query() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(
        &ctx,
        "CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, value REAL)",
        &[],
    )
    .await
    .unwrap();

    let res = pool
        .exec(
            &ctx,
            "INSERT INTO test (name, value) VALUES (?, ?)",
            &[Value::from("hello"), Value::Float(1.5)],
        )
        .await
        .unwrap();
    assert_eq!(res.last_insert_id, Some(1));
    assert_eq!(res.rows_affected, Some(1));

    let mut rows = pool.query(&ctx, "SELECT * FROM test", &[]).await.unwrap();
    assert_eq!(rows.columns(), ["id", "name", "value"]);
    let row = rows.next_row().await.unwrap().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 1);
    assert_eq!(row.get_by_name::<String>("name").unwrap(), "hello");
    assert_eq!(row.get::<f64>(2).unwrap(), 1.5);
    assert!(rows.next_row().await.unwrap().is_none());
}

#[tokio::test]
async fn test_null_values() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (id INTEGER, name TEXT)", &[])
        .await
        .unwrap();
    pool.exec(
        &ctx,
        "INSERT INTO test (id, name) VALUES (?, ?)",
        &[Value::Int(1), Value::from(None::<String>)],
    )
    .await
    .unwrap();

    let rows = pool
        .query(&ctx, "SELECT name FROM test", &[])
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows[0].values(), [Value::Null]);
}

#[tokio::test]
async fn test_blob_values() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (data BLOB)", &[])
        .await
        .unwrap();

    let data = vec![0xDE, 0xAD, 0xBE, 0xEF];
    pool.exec(
        &ctx,
        "INSERT INTO test (data) VALUES (?)",
        &[Value::from(data.clone())],
    )
    .await
    .unwrap();

    let mut rows = pool.query(&ctx, "SELECT * FROM test", &[]).await.unwrap();
    let row = rows.next_row().await.unwrap().unwrap();
    assert_eq!(row.get::<Vec<u8>>(0).unwrap(), data);
}

#[tokio::test]
async fn test_multiple_rows() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let mut conn = pool.acquire(&ctx).await.unwrap();
    let stmt = conn
        .prepare(&ctx, "INSERT INTO test (id) VALUES (?)")
        .await
        .unwrap();
    assert_eq!(stmt.num_input(), Some(1));
    for i in 0..100 {
        stmt.exec(&ctx, &[Value::Int(i)]).await.unwrap();
    }
    conn.release().await;

    let rows = pool
        .query(&ctx, "SELECT * FROM test", &[])
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 100);
}

#[tokio::test]
async fn test_argument_count_checked_before_execution() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (a INTEGER, b INTEGER)", &[])
        .await
        .unwrap();

    let mut conn = pool.acquire(&ctx).await.unwrap();
    let stmt = conn
        .prepare(&ctx, "INSERT INTO test (a, b) VALUES (?, ?)")
        .await
        .unwrap();
    assert!(matches!(
        stmt.exec(&ctx, &[Value::Int(1)]).await,
        Err(Error::ArgumentCount { expected: 2, given: 1 })
    ));
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_constraint_violation_passes_through() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    pool.exec(&ctx, "INSERT INTO test (id) VALUES (1)", &[])
        .await
        .unwrap();

    let err = pool
        .exec(&ctx, "INSERT INTO test (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Server { .. }), "{err}");

    // A server error does not break the connection
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let pool = memory_pool();
    let ctx = Context::background();

    pool.exec(&ctx, "CREATE TABLE test (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let mut tx = pool.begin(&ctx).await.unwrap();
    tx.exec(&ctx, "INSERT INTO test (id) VALUES (?)", &[Value::Int(1)])
        .await
        .unwrap();
    tx.commit(&ctx).await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);

    let mut tx = pool.begin(&ctx).await.unwrap();
    tx.exec(&ctx, "INSERT INTO test (id) VALUES (?)", &[Value::Int(2)])
        .await
        .unwrap();
    tx.rollback(&ctx).await.unwrap();

    let rows = pool
        .query(&ctx, "SELECT id FROM test", &[])
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i64>(0).unwrap(), 1);
}

#[tokio::test]
async fn test_exec_batch() {
    let pool = memory_pool();
    let ctx = Context::background();

    let mut conn = pool.acquire(&ctx).await.unwrap();
    conn.exec_batch(
        &ctx,
        "CREATE TABLE a (id INTEGER); CREATE TABLE b (id INTEGER); INSERT INTO a VALUES (7);",
    )
    .await
    .unwrap();

    let mut rows = conn.query(&ctx, "SELECT id FROM a", &[]).await.unwrap();
    let mut buf = vec![Value::Null];
    assert_eq!(rows.next(&mut buf).await.unwrap(), Fetch::Row);
    assert_eq!(buf[0], Value::Int(7));
}

#[tokio::test]
async fn test_cursor_survives_statement_close() {
    let pool = memory_pool();
    let ctx = Context::background();

    let mut conn = pool.acquire(&ctx).await.unwrap();
    conn.exec(&ctx, "CREATE TABLE test (id INTEGER)", &[])
        .await
        .unwrap();
    conn.exec(&ctx, "INSERT INTO test VALUES (1), (2)", &[])
        .await
        .unwrap();

    let mut stmt = conn.prepare(&ctx, "SELECT id FROM test").await.unwrap();
    let mut rows = stmt.query(&ctx, &[]).await.unwrap();
    stmt.close().await.unwrap();

    assert_eq!(rows.collect_rows().await.unwrap().len(), 2);
    assert!(matches!(stmt.query(&ctx, &[]).await, Err(Error::StatementClosed)));
}

#[tokio::test]
async fn test_shared_memory_database_across_connections() {
    let pool = shared_pool("sqlite_tests_shared", 2);
    let ctx = Context::background();

    let mut a = pool.acquire(&ctx).await.unwrap();
    let mut b = pool.acquire(&ctx).await.unwrap();
    a.exec(&ctx, "CREATE TABLE test (id INTEGER)", &[])
        .await
        .unwrap();
    a.exec(&ctx, "INSERT INTO test VALUES (42)", &[])
        .await
        .unwrap();

    let mut rows = b.query(&ctx, "SELECT id FROM test", &[]).await.unwrap();
    let row = rows.next_row().await.unwrap().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 42);
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn test_file_database_uses_wal() {
    let path = std::env::temp_dir().join(format!("sqlbridge-{}.db", uuid::Uuid::new_v4()));
    let source = format!("sqlite://{}", path.display());
    let pool = Pool::open(Arc::new(SqliteDriver), source, PoolConfig::new()).unwrap();
    let ctx = Context::background();

    let mut rows = pool
        .query(&ctx, "PRAGMA journal_mode", &[])
        .await
        .unwrap();
    let row = rows.next_row().await.unwrap().unwrap();
    assert_eq!(row.get::<String>(0).unwrap(), "wal");
    drop(rows);

    pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[tokio::test]
async fn test_registered_driver() {
    // Other tests may have registered it already
    let _ = register();
    let pool = crate::registry::open(DRIVER_NAME, "sqlite::memory:").unwrap();
    pool.ping(&Context::background()).await.unwrap();
    assert!(pool.capabilities().direct_query);
}
