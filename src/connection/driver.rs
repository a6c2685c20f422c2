//! The connection driver task
//!
//! One spawned task owns the socket, the framer, and the state machine.
//! Callers never touch the socket: they enqueue commands over a channel and
//! await per-query completion signals. Messages are processed in arrival
//! order, transitions are synchronous, and at most one request group is in
//! flight at a time; everything else waits in a FIFO.

use super::conn::{Command, ConnectionConfig, Lifecycle, Shared};
use super::machine::ConnState;
use super::query::{CachedStatement, Query, QueryResult, QueryRoute, Row, StatementCache};
use super::transport::Transport;
use crate::auth::{md5_password, ScramClient};
use crate::protocol::{
    affected_rows, encode_message, startup_message, AuthenticationRequest, BackendMessage,
    BoundValue, ErrorFields, FieldDescription, Framer, FrontendMessage, TransactionStatus,
};
use crate::types::{binary, decode_column, DecoderRegistry, PgType};
use crate::{Error, Result, ServerError};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// SQLSTATE the backend itself uses for statements inside a failed
/// transaction block.
const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

/// An established session handed from the handshake to the driver.
pub(crate) struct Session {
    pub transport: Transport,
    pub framer: Framer,
    pub state: ConnState,
}

/// Connect the socket, upgrade to TLS when requested, and run the startup
/// and authentication exchange. The caller wraps this in the connect timeout.
pub(crate) async fn handshake(cfg: &ConnectionConfig, shared: &Shared) -> Result<Session> {
    let mut transport = Transport::connect(&cfg.host, cfg.port).await?;

    if cfg.use_ssl {
        let mut buf = BytesMut::new();
        encode_message(&FrontendMessage::SslRequest, &mut buf);
        transport.write_all(&buf).await?;
        match transport.read_byte().await? {
            b'S' => {
                tracing::debug!("server accepted TLS, upgrading connection");
                transport = transport.upgrade_to_tls(&cfg.tls, &cfg.host).await?;
            }
            b'N' => return Err(Error::Config("server does not support TLS".into())),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected SSLRequest response byte: 0x{:02X}",
                    other
                )))
            }
        }
    }

    let mut state = ConnState::SocketConnected;
    let mut framer = Framer::new();

    let user = cfg.startup_user();
    let mut buf = BytesMut::new();
    encode_message(
        &startup_message(&user, &cfg.database, &cfg.time_zone),
        &mut buf,
    );
    transport.write_all(&buf).await?;

    loop {
        let msg = receive(&mut transport, &mut framer).await?;
        match msg {
            BackendMessage::Authentication(request) => match request {
                AuthenticationRequest::Ok => {
                    tracing::debug!("authentication successful");
                    state.transition(ConnState::Authenticated)?;
                }
                AuthenticationRequest::CleartextPassword => {
                    state.transition(ConnState::Authenticating)?;
                    let password = cfg.password_for_auth()?;
                    send(&mut transport, &FrontendMessage::Password(password.to_string()))
                        .await?;
                }
                AuthenticationRequest::Md5Password { salt } => {
                    state.transition(ConnState::Authenticating)?;
                    let password = cfg.password_for_auth()?;
                    let response = md5_password(&user, password, salt);
                    send(&mut transport, &FrontendMessage::Password(response)).await?;
                }
                AuthenticationRequest::Sasl { mechanisms } => {
                    state.transition(ConnState::Authenticating)?;
                    sasl_exchange(cfg, &mechanisms, &mut transport, &mut framer).await?;
                }
                AuthenticationRequest::SaslContinue { .. }
                | AuthenticationRequest::SaslFinal { .. } => {
                    return Err(Error::Protocol(
                        "SASL continuation outside a SASL exchange".into(),
                    ))
                }
            },
            BackendMessage::ParameterStatus { name, value } => {
                tracing::debug!(parameter = %name, value = %value, "server setting");
                shared.settings.lock().insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                *shared.backend_key.lock() = Some((process_id, secret_key));
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!("startup notice: {}", notice);
            }
            BackendMessage::ReadyForQuery(_) => {
                state.transition(ConnState::Idle)?;
                tracing::info!(user = %user, database = %cfg.database, "startup complete");
                return Ok(Session {
                    transport,
                    framer,
                    state,
                });
            }
            BackendMessage::ErrorResponse(fields) => {
                return Err(Error::Auth(fields.to_string()));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during startup: {:?}",
                    other
                )))
            }
        }
    }
}

/// Run the SCRAM-SHA-256 rounds inside the authentication loop.
async fn sasl_exchange(
    cfg: &ConnectionConfig,
    mechanisms: &[String],
    transport: &mut Transport,
    framer: &mut Framer,
) -> Result<()> {
    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
        return Err(Error::Auth(format!(
            "server offers no supported SASL mechanism (available: {})",
            mechanisms.join(", ")
        )));
    }
    let password = cfg.password_for_auth()?;
    let mut scram = ScramClient::new(password);

    let first = scram.client_first();
    send(
        transport,
        &FrontendMessage::SaslInitialResponse {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: first.into_bytes(),
        },
    )
    .await?;

    let server_first = match receive(transport, framer).await? {
        BackendMessage::Authentication(AuthenticationRequest::SaslContinue { data }) => {
            String::from_utf8(data)
                .map_err(|e| Error::Auth(format!("invalid UTF-8 in SCRAM challenge: {}", e)))?
        }
        BackendMessage::ErrorResponse(fields) => return Err(Error::Auth(fields.to_string())),
        other => {
            return Err(Error::Protocol(format!(
                "expected SASL challenge, got {:?}",
                other
            )))
        }
    };

    let client_final = scram.client_final(&server_first)?;
    send(
        transport,
        &FrontendMessage::SaslResponse {
            data: client_final.into_bytes(),
        },
    )
    .await?;

    let server_final = match receive(transport, framer).await? {
        BackendMessage::Authentication(AuthenticationRequest::SaslFinal { data }) => {
            String::from_utf8(data)
                .map_err(|e| Error::Auth(format!("invalid UTF-8 in SCRAM verifier: {}", e)))?
        }
        BackendMessage::ErrorResponse(fields) => return Err(Error::Auth(fields.to_string())),
        other => {
            return Err(Error::Protocol(format!(
                "expected SASL verifier, got {:?}",
                other
            )))
        }
    };
    scram.verify_server_final(&server_final)
}

async fn send(transport: &mut Transport, msg: &FrontendMessage) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_message(msg, &mut buf);
    transport.write_all(&buf).await
}

async fn receive(transport: &mut Transport, framer: &mut Framer) -> Result<BackendMessage> {
    let mut chunk = BytesMut::with_capacity(8192);
    loop {
        if let Some(msg) = framer.next_message()? {
            return Ok(msg);
        }
        let n = transport.read_buf(&mut chunk).await?;
        if n == 0 {
            return Err(Error::cancelled());
        }
        framer.extend(&chunk);
        chunk.clear();
    }
}

/// A request group being drained: its query plus everything accumulated
/// between dispatch and the terminating ReadyForQuery.
struct InFlight {
    query: Query,
    columns: Arc<Vec<FieldDescription>>,
    rows: Vec<Row>,
    affected: u64,
    /// First error seen; completion waits for ReadyForQuery
    error: Option<Error>,
    /// Extended-path rows arrive binary regardless of described format codes
    binary_results: bool,
    pending_cache: Option<PendingCache>,
}

/// Bookkeeping for a statement parsed this round; it becomes a cache entry
/// once the server confirms the parameter types and describes the rows.
struct PendingCache {
    key: String,
    name: String,
    declared: Vec<PgType>,
    store: bool,
    confirmed: Option<Vec<u32>>,
}

pub(crate) struct Driver {
    transport: Transport,
    framer: Framer,
    state: ConnState,
    main_queue: VecDeque<Query>,
    tx_queue: VecDeque<Query>,
    current_tx: Option<u64>,
    in_flight: Option<InFlight>,
    cache: StatementCache,
    registry: DecoderRegistry,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    pub(crate) fn new(
        session: Session,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        registry: DecoderRegistry,
        cache_capacity: usize,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            transport: session.transport,
            framer: session.framer,
            state: session.state,
            main_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            current_tx: None,
            in_flight: None,
            cache: StatementCache::new(cache_capacity),
            registry,
            shared,
            cmd_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut scratch = BytesMut::with_capacity(8192);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Enqueue(query)) => {
                        self.enqueue(query);
                        if let Err(e) = self.pump().await {
                            return self.shutdown(Some(e)).await;
                        }
                    }
                    Some(Command::Close) | None => return self.shutdown(None).await,
                },
                read = self.transport.read_buf(&mut scratch) => match read {
                    Ok(0) => return self.shutdown(Some(Error::cancelled())).await,
                    Ok(_) => {
                        self.framer.extend(&scratch);
                        scratch.clear();
                        if let Err(e) = self.drain_messages() {
                            return self.shutdown(Some(e)).await;
                        }
                        if let Err(e) = self.pump().await {
                            return self.shutdown(Some(e)).await;
                        }
                    }
                    Err(e) => return self.shutdown(Some(e)).await,
                },
            }
        }
    }

    fn drain_messages(&mut self) -> Result<()> {
        while let Some(msg) = self.framer.next_message()? {
            self.on_message(msg)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, query: Query) {
        match query.tx {
            Some(tx_id) if self.current_tx == Some(tx_id) => self.tx_queue.push_back(query),
            Some(_) => self.complete(
                query,
                Err(Error::Closed("transaction is closed".into())),
            ),
            None => self.main_queue.push_back(query),
        }
    }

    fn complete(&self, query: Query, result: Result<QueryResult>) {
        self.shared.query_done();
        query.finish(result);
    }

    /// Dispatch queued work while the machine is in a dispatch state.
    async fn pump(&mut self) -> Result<()> {
        while self.in_flight.is_none() && self.state.can_dispatch() {
            let next = match self.state {
                ConnState::Idle => self.main_queue.pop_front(),
                // a transaction block pulls from its own FIFO; a caller
                // managing BEGIN/COMMIT by hand stays on the main one
                ConnState::InTransaction if self.current_tx.is_some() => {
                    self.tx_queue.pop_front()
                }
                ConnState::InTransaction => self.main_queue.pop_front(),
                ConnState::FailedTransaction if self.current_tx.is_some() => loop {
                    // the failed block only gets to end itself; queued data
                    // queries are discarded
                    match self.tx_queue.pop_front() {
                        Some(q) if q.tx_control => break Some(q),
                        Some(q) => self.complete(q, Err(aborted_transaction_error())),
                        None => break None,
                    }
                },
                ConnState::FailedTransaction => self.main_queue.pop_front(),
                _ => None,
            };
            let Some(query) = next else { break };
            self.start_query(query).await?;
        }
        Ok(())
    }

    /// Send one request group down the socket and enter Busy. Serialization
    /// and reuse-validation failures never reach the socket; they complete
    /// the query through the deferred-failure path instead.
    async fn start_query(&mut self, query: Query) -> Result<()> {
        let mut buf = BytesMut::with_capacity(256);
        match self.prepare_dispatch(&query, &mut buf) {
            Ok((columns, pending_cache, binary_results)) => {
                self.state.transition(ConnState::Busy)?;
                self.in_flight = Some(InFlight {
                    query,
                    columns,
                    rows: Vec::new(),
                    affected: 0,
                    error: None,
                    binary_results,
                    pending_cache,
                });
                // one write per request group: Sync must close the batch
                // atomically on the wire
                self.transport.write_all(&buf).await
            }
            Err(e) => self.defer_failure(query, e),
        }
    }

    /// Encode the request group for `query` and return what the in-flight
    /// accumulator starts from: initial column metadata, the pending cache
    /// entry for a freshly parsed statement, and the result wire format.
    fn prepare_dispatch(
        &mut self,
        query: &Query,
        buf: &mut BytesMut,
    ) -> Result<(Arc<Vec<FieldDescription>>, Option<PendingCache>, bool)> {
        let (sql, params, allow_reuse) = match &query.route {
            QueryRoute::Simple { sql } => {
                encode_message(&FrontendMessage::Query(sql.clone()), buf);
                return Ok((Arc::new(Vec::new()), None, false));
            }
            QueryRoute::Extended {
                sql,
                params,
                allow_reuse,
                ..
            } => (sql, params, allow_reuse),
        };

        let key = query
            .route
            .cache_key()
            .expect("extended route has a cache key")
            .to_string();

        let mut bound = Vec::with_capacity(params.len());
        for param in params {
            match binary::encode(&param.value, param.ty)? {
                Some(bytes) => bound.push(BoundValue::binary(bytes)),
                None => bound.push(BoundValue::null()),
            }
        }
        let declared: Vec<PgType> = params.iter().map(|p| p.ty).collect();

        let cached = if *allow_reuse {
            self.cache.get(&key).cloned()
        } else {
            None
        };

        if let Some(entry) = cached {
            let compatible = entry.param_types.len() == declared.len()
                && declared
                    .iter()
                    .zip(&entry.param_types)
                    .all(|(ty, oid)| ty.matches_oid(*oid));
            if !compatible {
                self.cache.invalidate(&key);
                return Err(Error::InvalidType(format!(
                    "parameter types no longer match prepared statement {:?}",
                    key
                )));
            }
            // Parse and Describe are skipped on reuse; row metadata comes
            // from the cache entry
            encode_message(
                &FrontendMessage::Bind {
                    portal: String::new(),
                    statement: entry.name.clone(),
                    params: bound,
                },
                buf,
            );
            encode_message(
                &FrontendMessage::Execute {
                    portal: String::new(),
                },
                buf,
            );
            encode_message(&FrontendMessage::Sync, buf);
            return Ok((entry.columns, None, true));
        }

        let name = self.cache.next_statement_name();
        encode_message(
            &FrontendMessage::Parse {
                name: name.clone(),
                statement: sql.clone(),
            },
            buf,
        );
        encode_message(
            &FrontendMessage::Describe {
                statement: name.clone(),
            },
            buf,
        );
        encode_message(
            &FrontendMessage::Bind {
                portal: String::new(),
                statement: name.clone(),
                params: bound,
            },
            buf,
        );
        encode_message(
            &FrontendMessage::Execute {
                portal: String::new(),
            },
            buf,
        );
        encode_message(&FrontendMessage::Sync, buf);

        Ok((
            Arc::new(Vec::new()),
            Some(PendingCache {
                key,
                name,
                declared,
                store: *allow_reuse,
                confirmed: None,
            }),
            true,
        ))
    }

    /// Complete a query that never reached the socket, on the next tick, and
    /// stay dispatchable.
    fn defer_failure(&mut self, query: Query, error: Error) -> Result<()> {
        let resume = self.state;
        self.state.transition(ConnState::DeferredFailure)?;
        // the oneshot wakes its receiver on the caller's next poll
        self.complete(query, Err(error));
        self.state.transition(resume)?;
        Ok(())
    }

    fn on_message(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::NotificationResponse(notification) => {
                // lagging subscribers drop the oldest entries
                let _ = self.shared.notify_tx.send(notification);
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared.settings.lock().insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                *self.shared.backend_key.lock() = Some((process_id, secret_key));
            }
            BackendMessage::NoticeResponse(notice) => {
                tracing::debug!("server notice: {}", notice);
            }
            BackendMessage::Unknown { tag, body } => {
                tracing::debug!(tag = tag, len = body.len(), "skipping unknown backend message");
            }
            BackendMessage::ErrorResponse(fields) => return self.on_error_response(fields),
            BackendMessage::ReadyForQuery(status) => self.on_ready_for_query(status)?,
            other => self.on_query_message(other)?,
        }
        Ok(())
    }

    fn on_error_response(&mut self, fields: ErrorFields) -> Result<()> {
        let err = ServerError::from(fields);
        if err.is_fatal() {
            // no ReadyForQuery follows; fail the in-flight query and tear down
            if let Some(in_flight) = self.in_flight.take() {
                self.complete(in_flight.query, Err(Error::Server(err.clone())));
            }
            return Err(Error::Server(err));
        }
        match self.in_flight.as_mut() {
            Some(in_flight) => {
                // keep draining; the query fails once ReadyForQuery restores
                // a consistent state
                if in_flight.error.is_none() {
                    in_flight.error = Some(Error::Server(err));
                }
            }
            None => tracing::warn!("server error outside any query: {}", err),
        }
        Ok(())
    }

    fn on_query_message(&mut self, msg: BackendMessage) -> Result<()> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            tracing::debug!("ignoring {:?} with no query in flight", msg);
            return Ok(());
        };

        match msg {
            BackendMessage::ParameterDescription(oids) => {
                if let Some(pending) = in_flight.pending_cache.as_mut() {
                    let compatible = pending.declared.len() == oids.len()
                        && pending
                            .declared
                            .iter()
                            .zip(&oids)
                            .all(|(ty, oid)| ty.matches_oid(*oid));
                    if compatible {
                        pending.confirmed = Some(oids);
                    } else {
                        let key = pending.key.clone();
                        let declared = pending.declared.clone();
                        in_flight.pending_cache = None;
                        self.cache.invalidate(&key);
                        if in_flight.error.is_none() {
                            in_flight.error = Some(Error::InvalidType(format!(
                                "statement {:?} takes parameter types {:?}, but {:?} were supplied",
                                key, oids, declared
                            )));
                        }
                    }
                }
            }
            BackendMessage::RowDescription(fields) => {
                in_flight.columns = Arc::new(fields);
                let columns = in_flight.columns.clone();
                self.promote_cache_entry(columns);
            }
            BackendMessage::NoData => {
                self.promote_cache_entry(Arc::new(Vec::new()));
            }
            BackendMessage::DataRow(raw_columns) => {
                if in_flight.error.is_some() {
                    return Ok(());
                }
                if raw_columns.len() != in_flight.columns.len() {
                    in_flight.error = Some(Error::Protocol(format!(
                        "row has {} columns but {} were described",
                        raw_columns.len(),
                        in_flight.columns.len()
                    )));
                    return Ok(());
                }
                let mut values = Vec::with_capacity(raw_columns.len());
                for (fd, raw) in in_flight.columns.iter().zip(raw_columns.iter()) {
                    let format = if in_flight.binary_results {
                        1
                    } else {
                        fd.format_code
                    };
                    match decode_column(&self.registry, fd.type_oid, format, raw.as_ref()) {
                        Ok(value) => values.push(value),
                        Err(e) => {
                            in_flight.error = Some(e);
                            return Ok(());
                        }
                    }
                }
                in_flight
                    .rows
                    .push(Row::new(in_flight.columns.clone(), values));
            }
            BackendMessage::CommandComplete(tag) => {
                in_flight.affected = affected_rows(&tag);
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::EmptyQueryResponse => {}
            BackendMessage::Authentication(_) => {
                return Err(Error::Protocol(
                    "authentication request after startup".into(),
                ))
            }
            other => {
                tracing::debug!("ignoring {:?} during query", other);
            }
        }
        Ok(())
    }

    /// Move a confirmed pending statement into the reuse cache, now that the
    /// server has described its rows.
    fn promote_cache_entry(&mut self, columns: Arc<Vec<FieldDescription>>) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        if in_flight.error.is_some() {
            in_flight.pending_cache = None;
            return;
        }
        if let Some(pending) = in_flight.pending_cache.take() {
            if let (true, Some(param_types)) = (pending.store, pending.confirmed) {
                self.cache.insert(
                    pending.key,
                    CachedStatement {
                        name: pending.name,
                        param_types,
                        columns,
                    },
                );
            }
        }
    }

    fn on_ready_for_query(&mut self, status: TransactionStatus) -> Result<()> {
        let target = match status {
            TransactionStatus::Idle => ConnState::Idle,
            TransactionStatus::InTransaction => ConnState::InTransaction,
            TransactionStatus::Failed => ConnState::FailedTransaction,
        };

        if let Some(in_flight) = self.in_flight.take() {
            let InFlight {
                query,
                columns,
                rows,
                affected,
                error,
                ..
            } = in_flight;
            let begins_tx = query.begins_tx;

            let result = match error {
                Some(e) => Err(e),
                None => Ok(QueryResult {
                    columns,
                    rows,
                    affected,
                }),
            };
            self.complete(query, result);

            self.state.transition(target)?;
            match status {
                TransactionStatus::Idle => {
                    if self.current_tx.take().is_some() {
                        // the block is over; anything still queued on it can
                        // never run
                        while let Some(q) = self.tx_queue.pop_front() {
                            self.complete(q, Err(Error::Closed("transaction is closed".into())));
                        }
                    }
                }
                TransactionStatus::InTransaction => {
                    if let Some(id) = begins_tx {
                        self.current_tx = Some(id);
                    }
                }
                TransactionStatus::Failed => {}
            }
        } else if self.state != target {
            tracing::debug!(from = %self.state, to = %target, "resynchronized on ReadyForQuery");
            self.state = target;
        }
        Ok(())
    }

    async fn shutdown(mut self, reason: Option<Error>) {
        match &reason {
            Some(e) => tracing::debug!("connection closing: {}", e),
            None => {
                let mut buf = BytesMut::new();
                encode_message(&FrontendMessage::Terminate, &mut buf);
                let _ = self.transport.write_all(&buf).await;
            }
        }
        self.transport.shutdown().await;
        let _ = self.state.transition(ConnState::Closed);

        // every queued and in-flight query completes exactly once, all with
        // the same cancellation error
        if let Some(in_flight) = self.in_flight.take() {
            self.complete(in_flight.query, Err(Error::cancelled()));
        }
        while let Some(q) = self.tx_queue.pop_front() {
            self.complete(q, Err(Error::cancelled()));
        }
        while let Some(q) = self.main_queue.pop_front() {
            self.complete(q, Err(Error::cancelled()));
        }
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Command::Enqueue(q) = cmd {
                self.complete(q, Err(Error::cancelled()));
            }
        }

        *self.shared.lifecycle.lock() = Lifecycle::Closed;
        let _ = self.shared.done_tx.send(true);
    }
}

fn aborted_transaction_error() -> Error {
    Error::Server(ServerError {
        severity: "ERROR".into(),
        code: IN_FAILED_SQL_TRANSACTION.into(),
        message: "current transaction is aborted, query was discarded".into(),
        detail: None,
        hint: None,
    })
}
