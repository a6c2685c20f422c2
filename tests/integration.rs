//! Integration tests for pglink
//!
//! Most of these require a running Postgres instance with a `dart_test`
//! database reachable at localhost:5432 and are marked `#[ignore]`. The
//! timeout test only needs a local TCP listener and always runs.

use pglink::connection::{Connection, ConnectionConfig};
use pglink::{Error, SqlValue, TransactionOutcome};
use std::time::Duration;

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("localhost", 5432, "dart_test")
        .username("dart")
        .password("dart")
}

async fn open_test_connection() -> Connection {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let conn = Connection::new(test_config());
    conn.open().await.expect("open");
    conn
}

#[tokio::test]
async fn open_times_out_against_a_mute_server() {
    // a listener that accepts TCP but never speaks Postgres
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = tokio::spawn(async move {
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let conn = Connection::new(
        ConnectionConfig::new("127.0.0.1", port, "dart_test").timeout(Duration::from_secs(2)),
    );

    let started = std::time::Instant::now();
    let err = conn.open().await.expect_err("open must time out");
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("Timed out trying to connect"));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(5));

    // everything after the failed open reports the closed connection
    let err = conn.query("SELECT 1").await.expect_err("query must fail");
    assert!(err.to_string().contains("connection is closed"));

    server.abort();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn select_one_returns_a_single_cell() {
    let conn = open_test_connection().await;

    let result = conn.query("select 1").await.expect("query");
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get(0), Some(&SqlValue::Int(1)));

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn pipelined_queries_complete_in_enqueue_order() {
    let conn = open_test_connection().await;

    // five queries issued without awaiting any of them
    let (a, b, c, d, e) = tokio::join!(
        conn.query("select 1"),
        conn.query("select 2"),
        conn.query("select 3"),
        conn.query("select 4"),
        conn.query("select 5"),
    );

    let values: Vec<SqlValue> = [a, b, c, d, e]
        .into_iter()
        .map(|r| r.expect("query").rows[0].get(0).cloned().expect("cell"))
        .collect();
    assert_eq!(
        values,
        vec![
            SqlValue::Int(1),
            SqlValue::Int(2),
            SqlValue::Int(3),
            SqlValue::Int(4),
            SqlValue::Int(5),
        ]
    );

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn unique_violation_fails_the_query_but_not_the_connection() {
    let conn = open_test_connection().await;

    conn.execute("CREATE TEMPORARY TABLE t (i int unique)")
        .await
        .expect("create");
    assert_eq!(
        conn.execute("INSERT INTO t VALUES (1)").await.expect("insert"),
        1
    );

    let err = conn
        .execute("INSERT INTO t VALUES (1)")
        .await
        .expect_err("duplicate insert must fail");
    assert!(err.to_string().contains("duplicate key"));

    // error isolation: the connection is back to idle and usable
    assert_eq!(
        conn.execute("INSERT INTO t VALUES (2)").await.expect("insert"),
        1
    );

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn bad_password_closes_the_connection_for_good() {
    let conn = Connection::new(test_config().password("definitely-wrong"));

    let err = conn.open().await.expect_err("open must fail");
    assert!(err.to_string().contains("password authentication failed"));

    let err = conn.query("select 1").await.expect_err("query must fail");
    assert!(err.to_string().contains("connection is closed"));

    let err = conn.open().await.expect_err("reopen must fail");
    assert!(err
        .to_string()
        .contains("Attempting to reopen a closed connection"));
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn transaction_commits_and_returns_the_block_value() {
    let conn = open_test_connection().await;

    let outcome = conn
        .transaction(|tx| async move { tx.query("SELECT 1").await })
        .await
        .expect("transaction");

    match outcome {
        TransactionOutcome::Committed(result) => {
            assert_eq!(result.rows[0].get(0), Some(&SqlValue::Int(1)));
        }
        TransactionOutcome::RolledBack(reason) => panic!("unexpected rollback: {}", reason),
    }

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn cancelled_transaction_rolls_back_as_a_value() {
    let conn = open_test_connection().await;

    conn.execute("CREATE TEMPORARY TABLE audit (i int)")
        .await
        .expect("create");

    let outcome = conn
        .transaction(|tx| async move {
            tx.execute("INSERT INTO audit VALUES (1)").await?;
            Err::<(), Error>(tx.cancel("caller changed its mind"))
        })
        .await
        .expect("transaction call itself succeeds");

    assert_eq!(
        outcome,
        TransactionOutcome::RolledBack("caller changed its mind".into())
    );

    // the rollback discarded the insert
    let rows = conn.query("SELECT count(*) FROM audit").await.expect("count");
    assert_eq!(rows.rows[0].get(0), Some(&SqlValue::BigInt(0)));

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn failed_block_rolls_back_and_propagates_the_error() {
    let conn = open_test_connection().await;

    conn.execute("CREATE TEMPORARY TABLE ledger (i int unique)")
        .await
        .expect("create");

    let result = conn
        .transaction(|tx| async move {
            tx.execute("INSERT INTO ledger VALUES (1)").await?;
            tx.execute("INSERT INTO ledger VALUES (1)").await?; // duplicate
            Ok(())
        })
        .await;
    assert!(result.is_err());

    let rows = conn
        .query("SELECT count(*) FROM ledger")
        .await
        .expect("count");
    assert_eq!(rows.rows[0].get(0), Some(&SqlValue::BigInt(0)));

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn prepared_statement_reuse_parses_once() {
    let conn = open_test_connection().await;

    let sql = "SELECT $1::int + 40";
    let params = || {
        vec![pglink::substitute::BoundParam::new(
            pglink::PgType::Integer,
            SqlValue::Int(2),
        )]
    };

    let first = conn.query_params(sql, params()).await.expect("first run");
    assert_eq!(first.rows[0].get(0), Some(&SqlValue::Int(42)));

    let second = conn.query_params(sql, params()).await.expect("second run");
    assert_eq!(second.rows[0].get(0), Some(&SqlValue::Int(42)));

    // both executions share one server-side prepared statement
    let prepared = conn
        .query("SELECT count(*) FROM pg_prepared_statements WHERE statement = 'SELECT $1::int + 40'")
        .await
        .expect("introspection");
    assert_eq!(prepared.rows[0].get(0), Some(&SqlValue::BigInt(1)));

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn notifications_are_forwarded_to_subscribers() {
    let conn = open_test_connection().await;
    let mut notifications = conn.notifications();

    conn.execute("LISTEN pglink_events").await.expect("listen");
    conn.execute("NOTIFY pglink_events, 'hello'")
        .await
        .expect("notify");

    let notification =
        tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification within deadline")
            .expect("subscription alive");
    assert_eq!(notification.channel, "pglink_events");
    assert_eq!(notification.payload, "hello");

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn close_cancels_every_queued_query_exactly_once() {
    let conn = open_test_connection().await;

    let slow = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.query("SELECT pg_sleep(5)").await })
    };
    let queued = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.query("SELECT 1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    conn.close().await;

    for handle in [slow, queued] {
        let err = handle.await.expect("task").expect_err("cancelled");
        assert!(err
            .to_string()
            .contains("connection closed or query cancelled"));
    }
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn relation_name_resolves_via_pg_class() {
    let conn = open_test_connection().await;

    let result = conn
        .query("SELECT oid FROM pg_class WHERE relname = 'pg_class'")
        .await
        .expect("query");
    let oid = match result.rows[0].get(0) {
        Some(value) => value.as_i64().expect("oid column reads as integer") as u32,
        None => panic!("missing oid cell"),
    };

    let name = conn.relation_name(oid).await.expect("lookup");
    assert_eq!(name.as_deref(), Some("pg_class"));

    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn server_settings_include_session_timezone() {
    let conn = open_test_connection().await;
    let settings = conn.settings();
    assert_eq!(settings.get("TimeZone").map(String::as_str), Some("UTC"));
    assert!(conn.process_id().is_some());
    conn.close().await;
}
