//! # pglink
//!
//! An async PostgreSQL client speaking the v3 frontend/backend wire protocol
//! over TCP, optionally upgraded to TLS via the SSLRequest preamble.
//!
//! The crate is organized around its connection engine:
//!
//! * [`protocol`]: message types, frontend encoding, backend decoding, and
//!   the stream [`protocol::Framer`] that reassembles messages from TCP
//!   chunks
//! * [`types`]: the typed value model with binary and text codecs, plus the
//!   pluggable [`types::DecoderRegistry`]
//! * [`connection`]: the connection lifecycle state machine, the query
//!   pipeline (simple and extended protocol with prepared-statement reuse),
//!   transactions, and LISTEN/NOTIFY forwarding
//! * [`pool`]: a fixed-size connection pool with health checks and
//!   exponential-backoff reconnect
//! * [`substitute`]: the contract for external `@name` parameter
//!   substitutors
//!
//! ```no_run
//! # async fn example() -> pglink::Result<()> {
//! use pglink::connection::{Connection, ConnectionConfig};
//!
//! let conn = Connection::new(ConnectionConfig::new("localhost", 5432, "mydb").username("app"));
//! conn.open().await?;
//! let result = conn.query("SELECT 1").await?;
//! assert_eq!(result.rows.len(), 1);
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod pool;
pub mod protocol;
pub mod substitute;
pub mod types;

mod auth;

pub use connection::{Connection, ConnectionConfig, Transaction, TransactionOutcome};
pub use pool::{Pool, PoolConfig};
pub use protocol::{ErrorFields, FieldDescription, Notification};
pub use types::{DecoderRegistry, PgType, SqlValue};

use thiserror::Error as ThisError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the connection engine produces.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes from the backend; the connection closes
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials rejected during the handshake
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An ErrorResponse from the backend
    #[error("{0}")]
    Server(ServerError),

    /// Connect or handshake exceeded its budget
    #[error("{0}")]
    Timeout(String),

    /// Operation on a closed connection or pool
    #[error("{0}")]
    Closed(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime value does not fit the declared Postgres type
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Malformed value representation (uuid string, truncated column, ...)
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A transaction block asked for rollback; surfaced to callers as a
    /// [`TransactionOutcome::RolledBack`] value, not an error
    #[error("transaction rolled back: {0}")]
    Rollback(String),
}

impl Error {
    /// The cancellation error every pending query receives when its
    /// connection goes away.
    pub(crate) fn cancelled() -> Self {
        Error::Closed("connection closed or query cancelled".into())
    }

    /// The error for operations attempted on an already-closed connection.
    pub(crate) fn connection_closed() -> Self {
        Error::Closed("connection is closed".into())
    }
}

/// Error reported by the backend, with the fields callers act on.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Severity (ERROR, FATAL, PANIC, ...)
    pub severity: String,
    /// SQLSTATE code
    pub code: String,
    /// Primary message
    pub message: String,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
}

impl ServerError {
    /// FATAL and PANIC terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl From<protocol::ErrorFields> for ServerError {
    fn from(fields: protocol::ErrorFields) -> Self {
        Self {
            severity: fields.severity.unwrap_or_else(|| "ERROR".into()),
            code: fields.code.unwrap_or_default(),
            message: fields.message.unwrap_or_else(|| "unknown server error".into()),
            detail: fields.detail,
            hint: fields.hint,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, "; {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
