//! Connection engine
//!
//! This module holds:
//! * the transport (TCP, optionally TLS-upgraded via SSLRequest)
//! * the lifecycle state machine
//! * the driver task that owns the socket and drains backend messages
//! * the public connection facade, queries, and transactions

mod conn;
mod driver;
mod machine;
mod query;
mod tls;
mod transaction;
mod transport;

pub use conn::{Connection, ConnectionConfig};
pub use machine::ConnState;
pub use query::{QueryResult, Row};
pub use tls::TlsConfig;
pub use transaction::{Transaction, TransactionOutcome};
pub use transport::Transport;
