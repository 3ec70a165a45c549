//! Cell storage behind the in-memory evaluator.
//!
//! Native reads return member lists; the in-memory path additionally
//! needs aggregated cell values to apply NON EMPTY, measure filters
//! and measure ranking to the same effect as the generated statements.
//! [`CellReader`] is that seam: one cell per call, scoped the way a
//! SQL constraint scopes fact rows. An absent cell and a NULL
//! aggregate are the same thing, which is exactly the emptiness test
//! the non-empty probe compiles into SQL.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::model::catalog::Catalog;
use crate::model::cube::{Aggregator, CubeRef, MeasureKey};
use crate::model::hierarchy::HierarchyId;
use crate::model::member::MemberId;
use crate::sql::SqlExecutionError;

/// One aggregated cell: a point in member space, widened by optional
/// per-hierarchy scopes.
///
/// `coordinates` pins at most one stored member per hierarchy; fact
/// rows outside a coordinate's subtree do not contribute. `scopes`
/// union several stored members within one hierarchy (compound
/// slicers, partial-rollup grants) and are intersected with each other
/// and with the coordinates. All members restrict nothing and may be
/// omitted; calculated members must be expanded before they get here.
#[derive(Clone, Copy)]
pub struct CellRequest<'a> {
    pub catalog: &'a Catalog,
    pub cube: CubeRef,
    pub measure: &'a MeasureKey,
    pub coordinates: &'a [MemberId],
    pub scopes: &'a [(HierarchyId, Vec<MemberId>)],
}

/// Reads aggregated cells for the in-memory evaluator.
pub trait CellReader: Send + Sync {
    /// The cell's aggregated value. `None` when no fact row
    /// contributes; a NULL aggregate reads back as `None` too.
    fn cell(&self, request: &CellRequest<'_>) -> Result<Option<f64>, SqlExecutionError>;

    /// Whether the cell is empty under non-empty semantics. COUNT
    /// aggregates zero instead of NULL over an empty input, so a
    /// counting measure is empty at zero.
    fn is_empty(&self, request: &CellRequest<'_>) -> Result<bool, SqlExecutionError> {
        let counts_rows = request
            .catalog
            .measure(request.cube, request.measure)
            .and_then(|measure| measure.plain_column())
            .map(|(_, agg)| agg == Aggregator::Count)
            .unwrap_or(false);
        Ok(match self.cell(request)? {
            None => true,
            Some(value) => counts_rows && value == 0.0,
        })
    }
}
