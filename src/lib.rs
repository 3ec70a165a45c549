//! # Opal
//!
//! Native set evaluation for a ROLAP engine. Opal decides which set
//! expressions the relational store can answer directly, lowers them
//! to constrained SQL, caches the member lists that come back, and
//! evaluates everything else in memory with identical semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          AxisExpr (set expression + NON EMPTY)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [analyzer]
//! ┌─────────────────────────────────────────────────────────┐
//! │        NativePlan (flattened crossjoin arguments)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [constraint builder]
//! ┌─────────────────────────────────────────────────────────┐
//! │   (CacheTarget, SqlConstraint) + content fingerprint     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [result cache / SQL generator]
//! ┌─────────────────────────────────────────────────────────┐
//! │         TupleList (canonically ordered members)          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Axes the analyzer rejects evaluate through [`eval`] against the
//! same cell store, so callers never observe which path answered.

pub mod cache;
pub mod config;
pub mod constraint;
pub mod error;
pub mod eval;
pub mod expr;
pub mod model;
pub mod native;
pub mod sql;
pub mod store;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::{ResultCache, TupleList};
    pub use crate::config::{AlertPolicy, NativeConfig};
    pub use crate::error::{NativeError, NativeResult};
    pub use crate::expr::{AxisExpr, CompareOp, NumericExpr, Predicate, SetExpr};
    pub use crate::model::{
        CancelToken, Catalog, CatalogBuilder, CubeRef, EvalContext, HierarchySpec, KeyValue,
        LevelSpec, MeasureKey, MemberId, MemberKey, Role,
    };
    pub use crate::native::{
        CollectingSink, NativeEvaluator, NativeEvent, NativeEventSink, NoopSink,
    };
    pub use crate::sql::{Dialect, SqlExecutor, SqlRequest};
    pub use crate::store::{CellReader, CellRequest, SqliteStore};
}

// Also export at crate root for convenience
pub use cache::{ResultCache, TupleList};
pub use config::NativeConfig;
pub use error::{NativeError, NativeResult};
pub use expr::AxisExpr;
pub use model::{Catalog, EvalContext};
pub use native::NativeEvaluator;
