//! Connection facade
//!
//! [`Connection`] is a cheap-clone handle. The socket lives in a spawned
//! driver task; the facade talks to it over a command channel and awaits
//! per-query oneshot completions. A connection is single-use: once closed,
//! cleanly or through an error, it cannot be reopened.

use super::driver::{handshake, Driver};
use super::query::{Query, QueryResult, QueryRoute};
use super::tls::TlsConfig;
use super::transaction::{Transaction, TransactionOutcome};
use crate::protocol::Notification;
use crate::substitute::BoundParam;
use crate::types::{DecoderRegistry, PgType, SqlValue};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Notifications buffered per subscriber before the oldest are dropped.
const NOTIFICATION_BUFFER: usize = 128;

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Role to authenticate as; the server's default convention ("postgres")
    /// applies when unset
    pub username: Option<String>,
    /// Password, when the server demands one
    pub password: Option<String>,
    /// Budget for TCP connect plus the whole handshake (default 30s)
    pub timeout: Duration,
    /// Session TimeZone setting (default UTC)
    pub time_zone: String,
    /// Negotiate TLS via SSLRequest before the startup packet
    pub use_ssl: bool,
    /// TLS trust settings; the default accepts any certificate
    pub tls: TlsConfig,
    /// Column decoders; the built-in codec table plus caller overrides
    pub registry: DecoderRegistry,
    /// Prepared-statement reuse cache capacity
    pub cache_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            time_zone: "UTC".to_string(),
            use_ssl: false,
            tls: TlsConfig::default(),
            registry: DecoderRegistry::new(),
            cache_capacity: 100,
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub(crate) fn startup_user(&self) -> String {
        self.username.clone().unwrap_or_else(|| "postgres".to_string())
    }

    pub(crate) fn password_for_auth(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("server requested a password but none was configured".into()))
    }
}

/// Where the connection is in its single-use life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// `open()` not called yet
    Fresh,
    /// Handshake in flight; queries may already queue
    Opening,
    /// Driver running
    Open,
    /// Terminal
    Closed,
}

/// Commands the facade sends to the driver task.
pub(crate) enum Command {
    Enqueue(Query),
    Close,
}

/// State both the facade and the driver touch.
pub(crate) struct Shared {
    pub settings: Mutex<HashMap<String, String>>,
    pub backend_key: Mutex<Option<(i32, i32)>>,
    pub lifecycle: Mutex<Lifecycle>,
    pub relation_names: Mutex<HashMap<u32, Option<String>>>,
    pub done_tx: watch::Sender<bool>,
    pub notify_tx: broadcast::Sender<Notification>,
    pending: AtomicUsize,
    next_tx_id: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            settings: Mutex::new(HashMap::new()),
            backend_key: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Fresh),
            relation_names: Mutex::new(HashMap::new()),
            done_tx,
            notify_tx,
            pending: AtomicUsize::new(0),
            next_tx_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn query_queued(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn query_done(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An async PostgreSQL connection.
#[derive(Clone)]
pub struct Connection {
    cfg: Arc<ConnectionConfig>,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Held here until `open()` hands it to the driver (or a failed open
    /// drains it)
    cmd_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Command>>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.cfg.host)
            .field("port", &self.cfg.port)
            .field("database", &self.cfg.database)
            .field("lifecycle", &*self.shared.lifecycle.lock())
            .finish()
    }
}

impl Connection {
    /// Create the handle; no I/O happens until [`Connection::open`].
    pub fn new(cfg: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            cfg: Arc::new(cfg),
            shared: Arc::new(Shared::new()),
            cmd_tx,
            cmd_rx: Arc::new(Mutex::new(Some(cmd_rx))),
        }
    }

    /// Connect, authenticate, and start the driver task.
    ///
    /// Single-shot: it succeeds at most once, and any further call (or a
    /// call after `close()`) fails. The TCP connect and the whole handshake
    /// share the configured timeout; on expiry the socket is destroyed and
    /// every already-queued query is cancelled.
    ///
    /// Queries may be issued while `open()` is still in flight; they wait in
    /// the FIFO and run once the connection reaches its idle state.
    pub async fn open(&self) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Fresh => *lifecycle = Lifecycle::Opening,
                _ => {
                    return Err(Error::Closed(
                        "Attempting to reopen a closed connection".into(),
                    ))
                }
            }
        }

        let session = match tokio::time::timeout(
            self.cfg.timeout,
            handshake(&self.cfg, &self.shared),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.abort_open();
                return Err(e);
            }
            Err(_) => {
                self.abort_open();
                return Err(Error::Timeout(format!(
                    "Timed out trying to connect to {}:{}",
                    self.cfg.host, self.cfg.port
                )));
            }
        };

        let cmd_rx = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if *lifecycle != Lifecycle::Opening {
                // close() won the race during the handshake
                drop(lifecycle);
                self.abort_open();
                return Err(Error::connection_closed());
            }
            let Some(cmd_rx) = self.cmd_rx.lock().take() else {
                drop(lifecycle);
                self.abort_open();
                return Err(Error::connection_closed());
            };
            *lifecycle = Lifecycle::Open;
            cmd_rx
        };

        let driver = Driver::new(
            session,
            cmd_rx,
            self.cfg.registry.clone(),
            self.cfg.cache_capacity,
            self.shared.clone(),
        );
        tokio::spawn(driver.run());
        Ok(())
    }

    /// Open failed (or was pre-empted): close out the lifecycle, cancel
    /// whatever queued meanwhile, and resolve `done`.
    fn abort_open(&self) {
        *self.shared.lifecycle.lock() = Lifecycle::Closed;
        if let Some(mut cmd_rx) = self.cmd_rx.lock().take() {
            cmd_rx.close();
            while let Ok(cmd) = cmd_rx.try_recv() {
                if let Command::Enqueue(query) = cmd {
                    self.shared.query_done();
                    query.finish(Err(Error::cancelled()));
                }
            }
        }
        let _ = self.shared.done_tx.send(true);
    }

    /// Execute a statement over the simple-query path and report the
    /// affected-row count.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let result = self
            .run_query(
                QueryRoute::Simple {
                    sql: sql.to_string(),
                },
                true,
                None,
                None,
                false,
            )
            .await?;
        Ok(result.affected)
    }

    /// Run a statement over the extended path and return its rows.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.query_with(sql, Vec::new(), true, None).await
    }

    /// Extended path with ordered, typed parameters.
    pub async fn query_params(&self, sql: &str, params: Vec<BoundParam>) -> Result<QueryResult> {
        self.query_with(sql, params, true, None).await
    }

    /// Extended path with full control over prepared-statement reuse.
    ///
    /// With `allow_reuse` the parsed statement is cached keyed by
    /// `statement_id` (or the SQL text) and later invocations skip Parse.
    pub async fn query_with(
        &self,
        sql: &str,
        params: Vec<BoundParam>,
        allow_reuse: bool,
        statement_id: Option<&str>,
    ) -> Result<QueryResult> {
        self.run_query(
            QueryRoute::Extended {
                sql: sql.to_string(),
                params,
                allow_reuse,
                statement_id: statement_id.map(str::to_string),
            },
            false,
            None,
            None,
            false,
        )
        .await
    }

    /// Run `block` inside BEGIN/COMMIT.
    ///
    /// Queries inside the block go through the transaction handle and run on
    /// this connection, drawn from the transaction's own queue. The block's
    /// `Ok` commits; requesting rollback through [`Transaction::cancel`]
    /// rolls back and yields [`TransactionOutcome::RolledBack`] (a value, not
    /// an error); any other error rolls back and propagates.
    pub async fn transaction<F, Fut, T>(&self, block: F) -> Result<TransactionOutcome<T>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx_id = self.shared.next_tx_id.fetch_add(1, Ordering::Relaxed);

        self.run_query(
            QueryRoute::Simple {
                sql: "BEGIN".to_string(),
            },
            true,
            Some(tx_id),
            None,
            false,
        )
        .await?;

        let handle = Transaction::new(self.clone(), tx_id);
        let outcome = block(handle).await;

        match outcome {
            Ok(value) => {
                self.tx_control(tx_id, "COMMIT").await?;
                Ok(TransactionOutcome::Committed(value))
            }
            Err(Error::Rollback(reason)) => {
                self.tx_control(tx_id, "ROLLBACK").await?;
                Ok(TransactionOutcome::RolledBack(reason))
            }
            Err(e) => {
                // the block already failed; a rollback failure adds nothing
                let _ = self.tx_control(tx_id, "ROLLBACK").await;
                Err(e)
            }
        }
    }

    async fn tx_control(&self, tx_id: u64, sql: &str) -> Result<()> {
        self.run_query(
            QueryRoute::Simple {
                sql: sql.to_string(),
            },
            true,
            None,
            Some(tx_id),
            true,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn run_query(
        &self,
        route: QueryRoute,
        only_affected: bool,
        begins_tx: Option<u64>,
        tx: Option<u64>,
        tx_control: bool,
    ) -> Result<QueryResult> {
        if *self.shared.lifecycle.lock() == Lifecycle::Closed {
            return Err(Error::connection_closed());
        }

        let (completion, rx) = oneshot::channel();
        let query = Query {
            route,
            only_affected,
            begins_tx,
            tx,
            tx_control,
            completion,
        };

        self.shared.query_queued();
        if self.cmd_tx.send(Command::Enqueue(query)).is_err() {
            self.shared.query_done();
            return Err(Error::connection_closed());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::cancelled()),
        }
    }

    /// Close the connection: destroy the socket, resolve `done`, and fail
    /// every queued and in-flight query with the cancellation error.
    /// Idempotent; completes once the driver has wound down.
    pub async fn close(&self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return;
            }
            *lifecycle = Lifecycle::Closed;
        }

        if self.cmd_rx.lock().is_some() {
            // never opened: there is no driver to wind down
            self.abort_open();
            return;
        }

        let _ = self.cmd_tx.send(Command::Close);
        self.done().await;
    }

    /// Resolves when the connection has fully closed, whatever the cause.
    /// Resolves immediately on an already-closed connection.
    pub async fn done(&self) {
        let mut rx = self.shared.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        *self.shared.lifecycle.lock() == Lifecycle::Closed
    }

    /// Subscribe to LISTEN/NOTIFY traffic.
    ///
    /// Notifications arrive in the order the backend sent them. The channel
    /// buffers [`NOTIFICATION_BUFFER`] entries per subscriber; a lagging
    /// subscriber loses the oldest ones and observes the gap as a
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notify_tx.subscribe()
    }

    /// Server parameter settings reported during startup and since.
    pub fn settings(&self) -> HashMap<String, String> {
        self.shared.settings.lock().clone()
    }

    /// Backend process ID, once assigned.
    pub fn process_id(&self) -> Option<i32> {
        self.shared.backend_key.lock().map(|(pid, _)| pid)
    }

    /// Backend secret key, once assigned.
    pub fn secret_key(&self) -> Option<i32> {
        self.shared.backend_key.lock().map(|(_, key)| key)
    }

    /// Queries enqueued but not yet completed. The pool reads this to pick
    /// the least-loaded connection.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// Resolve a result column's `table_oid` to its relation name via
    /// `pg_class`, caching lookups for the connection's lifetime.
    pub async fn relation_name(&self, table_oid: u32) -> Result<Option<String>> {
        if let Some(cached) = self.shared.relation_names.lock().get(&table_oid) {
            return Ok(cached.clone());
        }
        let result = self
            .query_params(
                "SELECT relname FROM pg_class WHERE oid = $1::oid",
                vec![BoundParam::new(PgType::Integer, SqlValue::Int(table_oid as i32))],
            )
            .await?;
        let name = result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.shared
            .relation_names
            .lock()
            .insert(table_oid, name.clone());
        Ok(name)
    }

    /// Two handles to the same underlying connection?
    pub(crate) fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
