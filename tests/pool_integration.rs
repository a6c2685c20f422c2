//! Pool integration tests
//!
//! These require a running Postgres instance with a `dart_test` database at
//! localhost:5432.

use pglink::connection::ConnectionConfig;
use pglink::pool::{Pool, PoolConfig};
use pglink::SqlValue;
use std::time::Duration;

fn pool_config(size: usize) -> PoolConfig {
    PoolConfig::new(
        size,
        ConnectionConfig::new("localhost", 5432, "dart_test")
            .username("dart")
            .password("dart"),
    )
    .max_retry_interval(Duration::from_secs(5))
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn pool_opens_and_serves_queries() {
    let pool = Pool::new(pool_config(3));
    pool.open().await.expect("pool open");
    assert_eq!(pool.available(), 3);

    let handle = pool.acquire().await.expect("acquire");
    let result = handle.query("select 1").await.expect("query");
    assert_eq!(result.rows[0].get(0), Some(&SqlValue::Int(1)));
    drop(handle);

    assert_eq!(pool.available(), 3);
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn exhausted_pool_queues_acquirers_fifo() {
    let pool = Pool::new(pool_config(1));
    pool.open().await.expect("pool open");

    let first = pool.acquire().await.expect("first acquire");

    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let handle = pool.acquire().await.expect("queued acquire");
            handle.query("select 2").await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.checked_out(), 1);

    drop(first);
    let result = queued.await.expect("task").expect("query");
    assert_eq!(result.rows[0].get(0), Some(&SqlValue::Int(2)));

    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn dead_connection_is_replaced() {
    let pool = Pool::new(pool_config(2));
    pool.open().await.expect("pool open");

    let handle = pool.acquire().await.expect("acquire");
    handle.close().await; // kill the underlying connection
    drop(handle);

    // the done-watcher schedules a replacement with minimal backoff
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.available(), 2);

    let handle = pool.acquire().await.expect("acquire after replacement");
    let result = handle.query("select 3").await.expect("query");
    assert_eq!(result.rows[0].get(0), Some(&SqlValue::Int(3)));
    drop(handle);

    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn heartbeat_keeps_the_pool_at_size() {
    let pool = Pool::new(pool_config(2).heartbeat_interval(Duration::from_millis(200)));
    pool.open().await.expect("pool open");

    // several heartbeat rounds against healthy connections change nothing
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.available(), 2);

    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn close_waits_for_checked_out_handles() {
    let pool = Pool::new(pool_config(1));
    pool.open().await.expect("pool open");

    let handle = pool.acquire().await.expect("acquire");
    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closer.is_finished());

    drop(handle);
    closer.await.expect("close completes");

    let err = pool.acquire().await.expect_err("acquire after close");
    assert!(err.to_string().contains("pool is closed"));
}
