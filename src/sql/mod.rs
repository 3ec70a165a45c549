//! SQL lowering and the executor seam.
//!
//! Constraint SQL is built as a token stream and serialized per
//! dialect:
//!
//! - [`token`] - token types and the dialect-aware serializer
//! - [`select`] - SELECT/UNION builder over those tokens
//! - [`generator`] - lowers `(target, constraint)` pairs to statements
//! - [`dialect`] - per-engine quoting, limits and regex syntax
//!
//! Execution stays behind [`SqlExecutor`] so the evaluator never sees a
//! connection type; a warehouse backend implements the trait and hands
//! back plain [`SqlRow`]s.

pub mod dialect;
pub mod generator;
pub mod select;
pub mod token;

#[cfg(test)]
pub mod test_utils;

pub use dialect::{Dialect, SqlDialect};
pub use generator::{GeneratedSql, RowShape, SlotShape, SqlGenerator};
pub use select::{SelectQuery, SqlExpr, SqlStatement, UnionQuery};
pub use token::{Token, TokenStream};

use crate::config::NativeConfig;
use crate::constraint::{CacheTarget, SqlConstraint};
use crate::model::catalog::Catalog;
use crate::model::member::KeyValue;
use crate::native::events::NativeEventSink;

/// Failure anywhere between a constraint and its result rows.
#[derive(Debug, thiserror::Error)]
pub enum SqlExecutionError {
    /// The constraint could not be turned into a statement.
    #[error("SQL lowering failed: {0}")]
    Lowering(String),

    /// The statement ran and the engine rejected it.
    #[error("{0}")]
    Execution(String),

    /// A returned key matched no member in the catalog.
    #[error("result row names an unknown member: {value} at {level}")]
    UnknownKey { level: String, value: String },
}

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Real(f64),
    Text(String),
    Null,
}

impl SqlValue {
    /// Fold into the member-key value space. Integer-valued REALs
    /// become Int so an engine's numeric affinity cannot split one
    /// member into two keys.
    pub fn to_key_value(&self) -> KeyValue {
        match self {
            SqlValue::Int(v) => KeyValue::Int(*v),
            SqlValue::Real(v) => {
                let truncated = *v as i64;
                if v.fract() == 0.0 && truncated as f64 == *v {
                    KeyValue::Int(truncated)
                } else {
                    KeyValue::Str(v.to_string())
                }
            }
            SqlValue::Text(s) => KeyValue::Str(s.clone()),
            SqlValue::Null => KeyValue::Null,
        }
    }
}

/// One result row: key columns in [`RowShape`] order.
pub type SqlRow = Vec<SqlValue>;

/// Everything an executor needs to lower and run one native read.
#[derive(Clone, Copy)]
pub struct SqlRequest<'a> {
    pub catalog: &'a Catalog,
    pub config: &'a NativeConfig,
    pub target: &'a CacheTarget,
    pub constraint: &'a SqlConstraint,
}

/// Runs lowered statements against a warehouse.
///
/// Implementations lower via [`SqlGenerator`] themselves so the
/// statement text always matches their dialect, and emit the
/// statement on the sink before running it.
pub trait SqlExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn execute(
        &self,
        request: &SqlRequest<'_>,
        sink: &dyn NativeEventSink,
    ) -> Result<Vec<SqlRow>, SqlExecutionError>;
}
