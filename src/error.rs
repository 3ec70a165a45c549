//! Statement-level error taxonomy for native evaluation.
//!
//! Only errors that abort the whole statement live here. Conflicting
//! cross-axis restrictions are *not* an error: the constraint builder
//! resolves them locally by dropping the conflicting restriction (§ the
//! builder module) and the caller never sees them.

use thiserror::Error;

use crate::sql::SqlExecutionError;

/// Result type for native evaluation.
pub type NativeResult<T> = Result<T, NativeError>;

/// Errors that abort a statement during native evaluation.
#[derive(Debug, Error)]
pub enum NativeError {
    /// A function that was explicitly requested as native could not be
    /// evaluated natively, and the alert policy is set to `error`.
    ///
    /// With policy `off` or `warn` the same condition is recovered by the
    /// in-memory fallback and this variant is never constructed.
    #[error("native evaluation of {function} is not supported: {reason}")]
    UnsupportedNativeEvaluation { function: String, reason: String },

    /// The result would exceed the configured cap. Always aborts.
    #[error("result size {attempted} exceeds the configured limit {cap}")]
    ResultSizeExceeded { attempted: u64, cap: u64 },

    /// A constraint could not be serialized for fingerprinting.
    #[error("constraint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The relational store failed to execute the generated SQL.
    /// The underlying failure is opaque to callers.
    #[error("SQL execution failed: {0}")]
    SqlExecutionFailure(#[from] SqlExecutionError),

    /// The statement was cancelled while a native build was in flight.
    /// The cache is left untouched.
    #[error("statement cancelled during native evaluation")]
    Cancelled,
}
