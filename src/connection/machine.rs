//! Connection lifecycle state machine
//!
//! The connection advances only on a parsed backend message, a caller
//! enqueue/close, or a timer. Only Idle, Busy, and the two transaction
//! states are indirectly observable by callers; the rest are internal.

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Terminal; also the pre-open placeholder
    Closed,

    /// TCP (and TLS, if requested) established; startup sent
    SocketConnected,

    /// Password or SASL exchange in progress
    Authenticating,

    /// AuthenticationOk seen, waiting for the first ReadyForQuery
    Authenticated,

    /// No query in flight; dispatches from the main FIFO
    Idle,

    /// One request group in flight, draining until ReadyForQuery
    Busy,

    /// Inside a transaction block; dispatches from the transaction's FIFO
    InTransaction,

    /// Transaction block failed; only the block's control statements run
    FailedTransaction,

    /// A query failed to serialize; it completes on the next tick while the
    /// connection stays usable
    DeferredFailure,
}

impl ConnState {
    /// Whether the machine may move to `next`.
    pub fn can_transition_to(&self, next: ConnState) -> bool {
        use ConnState::*;

        matches!(
            (self, next),
            (SocketConnected, Authenticating)
                | (SocketConnected, Authenticated)
                | (Authenticating, Authenticated)
                | (Authenticated, Idle)
                | (Idle, Busy)
                | (Idle, DeferredFailure)
                | (InTransaction, Busy)
                | (InTransaction, DeferredFailure)
                | (FailedTransaction, Busy)
                | (FailedTransaction, DeferredFailure)
                | (Busy, Idle)
                | (Busy, InTransaction)
                | (Busy, FailedTransaction)
                | (DeferredFailure, Idle)
                | (DeferredFailure, InTransaction)
                | (DeferredFailure, FailedTransaction)
                | (_, Closed)
        )
    }

    /// Move to `next`, rejecting transitions the protocol cannot produce.
    pub fn transition(&mut self, next: ConnState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::Protocol(format!(
                "invalid connection state transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// States that may start the next queued request group.
    pub fn can_dispatch(&self) -> bool {
        matches!(
            self,
            ConnState::Idle | ConnState::InTransaction | ConnState::FailedTransaction
        )
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::SocketConnected => write!(f, "socket_connected"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::InTransaction => write!(f, "in_transaction"),
            Self::FailedTransaction => write!(f, "failed_transaction"),
            Self::DeferredFailure => write!(f, "deferred_failure"),
        }
    }
}
