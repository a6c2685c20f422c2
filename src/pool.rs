//! Fixed-size connection pool
//!
//! The pool opens its target number of connections up front, hands the
//! least-loaded available one to each acquirer, and replaces any connection
//! whose `done` signal fires, waiting out an exponential-backoff delay while
//! replacements keep failing. An optional heartbeat probes available
//! connections with `SELECT 1` and evicts the unresponsive.

use crate::connection::{Connection, ConnectionConfig};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinSet;

/// Pool parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of live connections
    pub size: usize,
    /// Per-connection parameters
    pub conn: ConnectionConfig,
    /// Ceiling for the reconnect backoff delay
    pub max_retry_interval: Duration,
    /// Probe available connections at this interval; None disables the
    /// heartbeat
    pub heartbeat_interval: Option<Duration>,
}

impl PoolConfig {
    pub fn new(size: usize, conn: ConnectionConfig) -> Self {
        Self {
            size,
            conn,
            max_retry_interval: Duration::from_secs(30),
            heartbeat_interval: None,
        }
    }

    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Connection>,
}

#[derive(Default)]
struct PoolState {
    available: Vec<Connection>,
    checked_out: usize,
    waiters: VecDeque<Waiter>,
    /// Accumulates while replacement attempts keep failing
    failed: u32,
}

struct PoolInner {
    cfg: PoolConfig,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    next_waiter_id: AtomicU64,
    /// Wakes `close()` whenever a checked-out handle comes back
    returned: Notify,
}

/// A fixed-size pool of [`Connection`]s.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cfg,
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
                next_waiter_id: AtomicU64::new(1),
                returned: Notify::new(),
            }),
        }
    }

    /// Open the pool's connections concurrently.
    ///
    /// Connections that open join the live set; failures feed the backoff
    /// counter and schedule retries. Only a pool that could not open a
    /// single connection reports an error.
    pub async fn open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("pool is closed".into()));
        }

        let mut join = JoinSet::new();
        for _ in 0..self.inner.cfg.size {
            let cfg = self.inner.cfg.conn.clone();
            join.spawn(async move {
                let conn = Connection::new(cfg);
                conn.open().await.map(|()| conn)
            });
        }

        let mut opened = 0usize;
        let mut last_error = None;
        while let Some(result) = join.join_next().await {
            match result.expect("connection open task does not panic") {
                Ok(conn) => {
                    opened += 1;
                    adopt(&self.inner, conn);
                }
                Err(e) => {
                    tracing::warn!("pool connection failed to open: {}", e);
                    self.inner.state.lock().failed += 1;
                    last_error = Some(e);
                    spawn_replacement(self.inner.clone());
                }
            }
        }

        if opened == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        if let Some(interval) = self.inner.cfg.heartbeat_interval {
            spawn_heartbeat(self.inner.clone(), interval);
        }
        Ok(())
    }

    /// Check out a connection, waiting forever if none is available.
    pub async fn acquire(&self) -> Result<PoolHandle> {
        self.acquire_timeout(None).await
    }

    /// Check out a connection, waiting at most `timeout` when given.
    ///
    /// Among available connections the one with the fewest pending queries
    /// wins. With none available the caller joins a FIFO wait-queue; a
    /// timed-out waiter removes itself and gets a timeout error.
    pub async fn acquire_timeout(&self, timeout: Option<Duration>) -> Result<PoolHandle> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("pool is closed".into()));
        }

        let (waiter_id, rx) = {
            let mut state = self.inner.state.lock();
            if let Some(conn) = take_least_loaded(&mut state) {
                state.checked_out += 1;
                return Ok(PoolHandle {
                    conn: Some(conn),
                    inner: self.inner.clone(),
                });
            }
            let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let wait = async {
            rx.await
                .map_err(|_| Error::Closed("pool is closed".into()))
        };

        let conn = match timeout {
            None => wait.await?,
            Some(budget) => match tokio::time::timeout(budget, wait).await {
                Ok(result) => result?,
                Err(_) => {
                    self.inner
                        .state
                        .lock()
                        .waiters
                        .retain(|w| w.id != waiter_id);
                    return Err(Error::Timeout(
                        "timed out waiting for a pool connection".into(),
                    ));
                }
            },
        };

        Ok(PoolHandle {
            conn: Some(conn),
            inner: self.inner.clone(),
        })
    }

    /// Live connections currently available for checkout.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    /// Handles currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().checked_out
    }

    /// Close the pool: fail the wait-queue, wait for checked-out handles to
    /// come back, then close every connection. Later `acquire` calls fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // dropping the senders fails every waiter with the pool-closed error
        let waiters = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);

        loop {
            let returned = self.inner.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();
            if self.inner.state.lock().checked_out == 0 {
                break;
            }
            returned.await;
        }

        let connections = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.available)
        };
        for conn in connections {
            conn.close().await;
        }
    }
}

/// Pick the available connection with the smallest pending-queue length.
fn take_least_loaded(state: &mut PoolState) -> Option<Connection> {
    let index = state
        .available
        .iter()
        .enumerate()
        .min_by_key(|(_, conn)| conn.pending_len())
        .map(|(i, _)| i)?;
    Some(state.available.swap_remove(index))
}

/// Put a live connection into service: watch its `done` signal and hand it
/// to a waiter or the available set.
fn adopt(inner: &Arc<PoolInner>, conn: Connection) {
    {
        let watched = conn.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            watched.done().await;
            on_connection_done(&inner, &watched);
        });
    }
    release(inner, conn, false);
}

/// A connection died: drop it from the pool and schedule a replacement.
fn on_connection_done(inner: &Arc<PoolInner>, conn: &Connection) {
    {
        let mut state = inner.state.lock();
        state.available.retain(|c| !c.same_connection(conn));
    }
    if !inner.closed.load(Ordering::SeqCst) {
        tracing::info!("pool connection closed; scheduling replacement");
        spawn_replacement(inner.clone());
    }
}

/// `min(2^(failed / size) ms, max_retry_interval)`
fn backoff_delay(failed: u32, size: usize, max: Duration) -> Duration {
    let exponent = failed / (size.max(1) as u32);
    let millis = 2u64
        .saturating_pow(exponent.min(63))
        .min(max.as_millis() as u64);
    Duration::from_millis(millis)
}

fn spawn_replacement(inner: Arc<PoolInner>) {
    tokio::spawn(async move {
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let failed = inner.state.lock().failed;
            let delay = backoff_delay(failed, inner.cfg.size, inner.cfg.max_retry_interval);
            tokio::time::sleep(delay).await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }

            let conn = Connection::new(inner.cfg.conn.clone());
            match conn.open().await {
                Ok(()) => {
                    inner.state.lock().failed = 0;
                    adopt(&inner, conn);
                    return;
                }
                Err(e) => {
                    tracing::warn!("pool reconnect failed: {}", e);
                    inner.state.lock().failed += 1;
                }
            }
        }
    });
}

fn spawn_heartbeat(inner: Arc<PoolInner>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let probes: Vec<Connection> = inner.state.lock().available.to_vec();
            for conn in probes {
                let healthy = matches!(
                    tokio::time::timeout(Duration::from_secs(5), conn.execute("SELECT 1")).await,
                    Ok(Ok(_))
                );
                if !healthy {
                    tracing::warn!("heartbeat failed; evicting pool connection");
                    // closing fires its done signal, which handles removal
                    // and replacement
                    conn.close().await;
                }
            }
        }
    });
}

/// Return a connection to the pool (or discard it when dead), resolving the
/// head waiter when one is queued.
fn release(inner: &Arc<PoolInner>, conn: Connection, from_checkout: bool) {
    let mut state = inner.state.lock();
    if from_checkout {
        state.checked_out -= 1;
    }

    if conn.is_closed() {
        // its done-watcher schedules the replacement
    } else if inner.closed.load(Ordering::SeqCst) {
        let conn = conn.clone();
        tokio::spawn(async move { conn.close().await });
    } else {
        let mut conn = Some(conn);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(conn.take().expect("value present until sent")) {
                Ok(()) => {
                    state.checked_out += 1;
                    break;
                }
                // the waiter timed out between queueing and now
                Err(returned) => conn = Some(returned),
            }
        }
        if let Some(conn) = conn {
            state.available.push(conn);
        }
    }

    drop(state);
    inner.returned.notify_waiters();
}

/// A checked-out connection; returns to the pool on drop.
pub struct PoolHandle {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
}

impl PoolHandle {
    /// Hand the connection back explicitly (same as dropping the handle).
    pub fn release(self) {}
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").finish_non_exhaustive()
    }
}

impl Deref for PoolHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            release(&self.inner, conn, true);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("size", &self.inner.cfg.size)
            .field("available", &state.available.len())
            .field("checked_out", &state.checked_out)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
