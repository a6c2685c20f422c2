//! Query objects, results, and the prepared-statement reuse cache

use crate::protocol::FieldDescription;
use crate::substitute::BoundParam;
use crate::types::SqlValue;
use crate::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::oneshot;

/// How a query travels on the wire.
#[derive(Debug, Clone)]
pub(crate) enum QueryRoute {
    /// Single `'Q'` round-trip; results arrive in text format
    Simple { sql: String },
    /// Parse/Bind/Describe/Execute/Sync with binary parameters and results
    Extended {
        sql: String,
        params: Vec<BoundParam>,
        allow_reuse: bool,
        statement_id: Option<String>,
    },
}

impl QueryRoute {
    /// Reuse-cache key: the explicit statement identifier when given,
    /// otherwise the statement text itself.
    pub(crate) fn cache_key(&self) -> Option<&str> {
        match self {
            QueryRoute::Simple { .. } => None,
            QueryRoute::Extended {
                sql, statement_id, ..
            } => Some(statement_id.as_deref().unwrap_or(sql)),
        }
    }
}

/// A query from enqueue to completion.
pub(crate) struct Query {
    pub route: QueryRoute,
    /// Caller only wants the affected-row count (execute path)
    pub only_affected: bool,
    /// This statement is the BEGIN establishing transaction `id`
    pub begins_tx: Option<u64>,
    /// Transaction this query belongs to (dispatched from its FIFO)
    pub tx: Option<u64>,
    /// COMMIT/ROLLBACK; still runs when the transaction has failed
    pub tx_control: bool,
    /// Completion signal back to the awaiting caller
    pub completion: oneshot::Sender<Result<QueryResult>>,
}

impl Query {
    /// Resolve the completion signal. A dropped receiver is fine; the caller
    /// stopped waiting.
    pub(crate) fn finish(self, result: Result<QueryResult>) {
        let _ = self.completion.send(result);
    }
}

/// Accumulated result of one query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column metadata; empty for statements that return no rows
    pub columns: Arc<Vec<FieldDescription>>,
    /// Decoded rows
    pub rows: Vec<Row>,
    /// Affected-row count from the CommandComplete tag
    pub affected: u64,
}

/// One decoded result row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<FieldDescription>>,
    values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<Vec<FieldDescription>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by column position.
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value by column name (first match).
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }

    /// Column metadata for this row.
    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// All values in column order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// A reuse-cache entry: the statement exists on the server under `name`, the
/// server confirmed `param_types` via ParameterDescription, and `columns`
/// holds the row metadata from its Describe. Reused executions skip both
/// Parse and Describe, so decoded rows borrow these descriptions.
#[derive(Debug, Clone)]
pub(crate) struct CachedStatement {
    pub name: String,
    pub param_types: Vec<u32>,
    pub columns: Arc<Vec<FieldDescription>>,
}

/// Statement text → server-side prepared statement, LRU-bounded.
///
/// An entry exists only after the server has confirmed parameter type
/// compatibility for it; a later mismatch removes the entry.
pub(crate) struct StatementCache {
    cache: LruCache<String, CachedStatement>,
    next_id: u64,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to at least 1");
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<&CachedStatement> {
        self.cache.get(key)
    }

    pub(crate) fn insert(&mut self, key: String, statement: CachedStatement) {
        self.cache.put(key, statement);
    }

    pub(crate) fn invalidate(&mut self, key: &str) {
        self.cache.pop(key);
    }

    /// Allocate the next server-side statement name: a monotonically
    /// increasing counter rendered as twelve zero-padded digits.
    pub(crate) fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{:012}", id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::oid;

    fn columns() -> Arc<Vec<FieldDescription>> {
        Arc::new(vec![
            FieldDescription {
                name: "id".into(),
                table_oid: 0,
                column_attr: 0,
                type_oid: oid::INT4,
                type_size: 4,
                type_modifier: -1,
                format_code: 1,
            },
            FieldDescription {
                name: "label".into(),
                table_oid: 0,
                column_attr: 0,
                type_oid: oid::TEXT,
                type_size: -1,
                type_modifier: -1,
                format_code: 1,
            },
        ])
    }

    #[test]
    fn row_access_by_index_and_name() {
        let row = Row::new(
            columns(),
            vec![SqlValue::Int(7), SqlValue::Text("seven".into())],
        );
        assert_eq!(row.get(0), Some(&SqlValue::Int(7)));
        assert_eq!(row.get_by_name("label"), Some(&SqlValue::Text("seven".into())));
        assert_eq!(row.get_by_name("missing"), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn statement_names_are_zero_padded_and_increasing() {
        let mut cache = StatementCache::default();
        assert_eq!(cache.next_statement_name(), "000000000000");
        assert_eq!(cache.next_statement_name(), "000000000001");
        let tenth = (2..10).map(|_| cache.next_statement_name()).last().unwrap();
        assert_eq!(tenth, "000000000009");
        assert_eq!(tenth.len(), 12);
    }

    #[test]
    fn cache_insert_get_invalidate() {
        let mut cache = StatementCache::new(8);
        cache.insert(
            "SELECT 1".into(),
            CachedStatement {
                name: "000000000000".into(),
                param_types: vec![],
                columns: Arc::new(Vec::new()),
            },
        );
        assert!(cache.get("SELECT 1").is_some());
        cache.invalidate("SELECT 1");
        assert!(cache.get("SELECT 1").is_none());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = StatementCache::new(2);
        for (i, sql) in ["a", "b", "c"].iter().enumerate() {
            cache.insert(
                sql.to_string(),
                CachedStatement {
                    name: format!("{:012}", i),
                    param_types: vec![],
                    columns: Arc::new(Vec::new()),
                },
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn cache_key_prefers_statement_identifier() {
        let route = QueryRoute::Extended {
            sql: "SELECT * FROM t WHERE i = $1".into(),
            params: vec![],
            allow_reuse: true,
            statement_id: Some("find_t".into()),
        };
        assert_eq!(route.cache_key(), Some("find_t"));

        let route = QueryRoute::Extended {
            sql: "SELECT 1".into(),
            params: vec![],
            allow_reuse: true,
            statement_id: None,
        };
        assert_eq!(route.cache_key(), Some("SELECT 1"));

        assert_eq!(
            QueryRoute::Simple { sql: "SELECT 1".into() }.cache_key(),
            None
        );
    }
}
