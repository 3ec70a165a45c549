//! Cubes, measures, aggregate tables and virtual cubes.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::model::hierarchy::{HierarchyId, LevelKey};

/// Stable qualified measure name, e.g. `[Measures].[Unit Sales]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MeasureKey(pub String);

impl MeasureKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeasureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SQL aggregation applied to a measure column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Aggregator {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl Aggregator {
    pub fn sql_name(self) -> &'static str {
        match self {
            Aggregator::Sum => "SUM",
            Aggregator::Count => "COUNT",
            Aggregator::Min => "MIN",
            Aggregator::Max => "MAX",
            Aggregator::Avg => "AVG",
        }
    }
}

/// How a measure is computed from the fact table.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureExpr {
    /// An aggregated fact column.
    Column { column: String, agg: Aggregator },
    /// Arithmetic over other measure expressions.
    Arith {
        left: Box<MeasureExpr>,
        op: ArithOp,
        right: Box<MeasureExpr>,
    },
    Literal(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
pub struct Measure {
    pub key: MeasureKey,
    pub name: String,
    pub expr: MeasureExpr,
}

impl Measure {
    /// The single aggregated column, when the measure is a plain one.
    pub fn plain_column(&self) -> Option<(&str, Aggregator)> {
        match &self.expr {
            MeasureExpr::Column { column, agg } => Some((column.as_str(), *agg)),
            _ => None,
        }
    }
}

/// How a cube attaches one hierarchy to its fact table.
#[derive(Debug, Clone)]
pub struct DimensionUsage {
    pub hierarchy: HierarchyId,
    /// Foreign key column on the fact table.
    pub fact_column: String,
}

/// A pre-aggregated fact table. It can substitute for the base fact
/// table when it carries a column for every constrained level and every
/// requested measure.
#[derive(Debug, Clone)]
pub struct AggTable {
    pub name: String,
    /// Level key column per dimension level the rollup preserves. Agg
    /// levels join by level key directly, with no dimension-table hop.
    pub level_columns: BTreeMap<LevelKey, String>,
    pub measure_columns: BTreeMap<MeasureKey, String>,
    /// Row count, used to prefer the smallest usable rollup.
    pub row_count: u64,
}

impl AggTable {
    pub fn covers_level(&self, level: &LevelKey) -> bool {
        self.level_columns.contains_key(level)
    }

    pub fn covers_measure(&self, measure: &MeasureKey) -> bool {
        self.measure_columns.contains_key(measure)
    }
}

/// A base cube over one fact table.
#[derive(Debug, Clone)]
pub struct Cube {
    pub name: String,
    pub fact_table: String,
    pub dimensions: Vec<DimensionUsage>,
    pub measures: Vec<Measure>,
    pub aggregates: Vec<AggTable>,
}

impl Cube {
    pub fn usage(&self, hierarchy: HierarchyId) -> Option<&DimensionUsage> {
        self.dimensions.iter().find(|u| u.hierarchy == hierarchy)
    }

    pub fn has_hierarchy(&self, hierarchy: HierarchyId) -> bool {
        self.usage(hierarchy).is_some()
    }

    pub fn measure(&self, key: &MeasureKey) -> Option<&Measure> {
        self.measures.iter().find(|m| &m.key == key)
    }
}

/// A virtual cube: a union of base cubes sharing conformed hierarchies.
#[derive(Debug, Clone)]
pub struct VirtualCube {
    pub name: String,
    pub base_cubes: Vec<String>,
    /// Which base cube each imported measure comes from.
    pub measure_cube: BTreeMap<MeasureKey, String>,
}

impl VirtualCube {
    /// Base cubes that carry at least one of the given measures, in
    /// declaration order. With no measures given, every base qualifies.
    pub fn bases_for_measures(&self, measures: &[MeasureKey]) -> Vec<&str> {
        if measures.is_empty() {
            return self.base_cubes.iter().map(String::as_str).collect();
        }
        self.base_cubes
            .iter()
            .filter(|base| {
                measures
                    .iter()
                    .any(|m| self.measure_cube.get(m).map(String::as_str) == Some(base.as_str()))
            })
            .map(String::as_str)
            .collect()
    }
}

/// A cube reference inside a catalog: either a base cube or a virtual one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeRef {
    Base(usize),
    Virtual(usize),
}
