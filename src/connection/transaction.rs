//! Transaction context
//!
//! [`Connection::transaction`](super::Connection::transaction) opens the
//! block with a BEGIN on the connection's main queue; queries issued through
//! the [`Transaction`] handle are drawn from the transaction's own queue
//! until COMMIT or ROLLBACK ends the block.

use super::conn::Connection;
use super::query::{QueryResult, QueryRoute};
use crate::substitute::BoundParam;
use crate::{Error, Result};

/// How a transaction block ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome<T> {
    /// COMMIT ran; the block's return value
    Committed(T),
    /// The block asked for rollback; the caller's reason. Distinct from an
    /// error: the enclosing `transaction` call still returns `Ok`.
    RolledBack(String),
}

impl<T> TransactionOutcome<T> {
    /// The committed value, if the block committed.
    pub fn committed(self) -> Option<T> {
        match self {
            TransactionOutcome::Committed(value) => Some(value),
            TransactionOutcome::RolledBack(_) => None,
        }
    }
}

/// Handle for issuing queries inside one transaction block.
#[derive(Debug, Clone)]
pub struct Transaction {
    conn: Connection,
    id: u64,
}

impl Transaction {
    pub(crate) fn new(conn: Connection, id: u64) -> Self {
        Self { conn, id }
    }

    /// Simple-path statement inside the transaction; affected-row count.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let result = self
            .conn
            .run_query(
                QueryRoute::Simple {
                    sql: sql.to_string(),
                },
                true,
                None,
                Some(self.id),
                false,
            )
            .await?;
        Ok(result.affected)
    }

    /// Extended-path query inside the transaction.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.query_params(sql, Vec::new()).await
    }

    /// Extended-path query with parameters inside the transaction.
    pub async fn query_params(&self, sql: &str, params: Vec<BoundParam>) -> Result<QueryResult> {
        self.conn
            .run_query(
                QueryRoute::Extended {
                    sql: sql.to_string(),
                    params,
                    allow_reuse: true,
                    statement_id: None,
                },
                false,
                None,
                Some(self.id),
                false,
            )
            .await
    }

    /// Ask the enclosing block to roll back.
    ///
    /// Returns the error value to propagate with `?`; `transaction` turns it
    /// into [`TransactionOutcome::RolledBack`] after issuing ROLLBACK.
    pub fn cancel(&self, reason: impl Into<String>) -> Error {
        Error::Rollback(reason.into())
    }
}
