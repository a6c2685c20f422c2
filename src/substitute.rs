//! Parameter substitution contract
//!
//! Statement text handed to this crate may contain `@name` or `@name:type`
//! placeholders. Parsing that syntax is an external collaborator's job; this
//! module fixes the shape of what the collaborator produces so the connection
//! engine can consume it:
//!
//! * a substituted literal SQL string for the simple-query path, or
//! * a `$1, $2, …` rewrite plus the ordered, typed parameter list for the
//!   extended path.

use crate::types::{PgType, SqlValue};
use crate::Result;
use std::collections::HashMap;

/// Named values supplied by the caller.
pub type Values = HashMap<String, SqlValue>;

/// One ordered parameter produced by an extended-path rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    /// Declared type the substitutor assigned to this parameter
    pub ty: PgType,
    /// The runtime value
    pub value: SqlValue,
}

impl BoundParam {
    pub fn new(ty: PgType, value: SqlValue) -> Self {
        Self { ty, value }
    }
}

/// An extended-path rewrite of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenStatement {
    /// Statement text using `$1, $2, …` placeholders
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<BoundParam>,
}

/// The substitutor contract.
///
/// Implementations own the `@name` placeholder grammar. Both methods receive
/// the raw statement text and the caller's named values.
pub trait Substitutor {
    /// Inline every placeholder as a SQL literal for the simple-query path.
    fn simple(&self, statement: &str, values: &Values) -> Result<String>;

    /// Rewrite placeholders to `$n` and return the ordered parameter list
    /// with the types declared in the placeholder annotations.
    fn extended(&self, statement: &str, values: &Values) -> Result<RewrittenStatement>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::text::literal;
    use crate::Error;

    /// A contract-shaped stand-in: no placeholder grammar, single `@v` slot.
    struct SingleSlot;

    impl Substitutor for SingleSlot {
        fn simple(&self, statement: &str, values: &Values) -> Result<String> {
            let value = values
                .get("v")
                .ok_or_else(|| Error::InvalidFormat("missing value for @v".into()))?;
            Ok(statement.replace("@v", &literal(value)))
        }

        fn extended(&self, statement: &str, values: &Values) -> Result<RewrittenStatement> {
            let value = values
                .get("v")
                .ok_or_else(|| Error::InvalidFormat("missing value for @v".into()))?;
            Ok(RewrittenStatement {
                sql: statement.replace("@v", "$1"),
                params: vec![BoundParam::new(PgType::Integer, value.clone())],
            })
        }
    }

    #[test]
    fn simple_path_inlines_literals() {
        let mut values = Values::new();
        values.insert("v".into(), SqlValue::Int(3));
        let sql = SingleSlot
            .simple("SELECT * FROM t WHERE i = @v", &values)
            .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE i = 3");
    }

    #[test]
    fn extended_path_rewrites_to_positional() {
        let mut values = Values::new();
        values.insert("v".into(), SqlValue::Int(3));
        let rewritten = SingleSlot
            .extended("SELECT * FROM t WHERE i = @v", &values)
            .unwrap();
        assert_eq!(rewritten.sql, "SELECT * FROM t WHERE i = $1");
        assert_eq!(rewritten.params.len(), 1);
        assert_eq!(rewritten.params[0].ty, PgType::Integer);
    }
}
