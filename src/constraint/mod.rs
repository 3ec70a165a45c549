//! SQL constraints: the content-hashable description of one native read.
//!
//! A native read is identified by WHAT it returns (the [`CacheTarget`],
//! one slot per tuple position) and HOW the fact and dimension rows are
//! restricted (the [`SqlConstraint`]). The constraint is plain data,
//! serialized and hashed into a [`Fingerprint`]; the pair
//! `(target, fingerprint)` is the only cache key the crate uses.

pub mod builder;
pub mod fingerprint;

pub use builder::{BuildOutcome, ConstraintBuilder, NativeRequest};
pub use fingerprint::Fingerprint;

use serde::Serialize;

use crate::error::NativeResult;
use crate::expr::CompareOp;
use crate::model::cube::MeasureKey;
use crate::model::hierarchy::{HierarchyKey, LevelKey};
use crate::model::member::{KeyValue, MemberKey};
use crate::model::role::RollupPolicy;

/// One tuple position of a native read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TargetSlot {
    /// Every member of a level.
    Level(LevelKey),
    /// Children of one member.
    Children(MemberKey),
    /// Descendants of one member at a level.
    Descendants { ancestor: MemberKey, level: LevelKey },
}

impl TargetSlot {
    /// The level whose members this slot produces, when fixed up front.
    /// `Children` slots resolve their level against the catalog later.
    pub fn level(&self) -> Option<&LevelKey> {
        match self {
            TargetSlot::Level(level) => Some(level),
            TargetSlot::Descendants { level, .. } => Some(level),
            TargetSlot::Children(_) => None,
        }
    }
}

/// What a native read returns: one slot per tuple position, axis order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheTarget(pub Vec<TargetSlot>);

impl CacheTarget {
    pub fn level(level: LevelKey) -> Self {
        Self(vec![TargetSlot::Level(level)])
    }

    pub fn children(parent: MemberKey) -> Self {
        Self(vec![TargetSlot::Children(parent)])
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn slots(&self) -> &[TargetSlot] {
        &self.0
    }
}

/// Equality constraint on one ancestor level, the prefix part of a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PrefixEq {
    pub level: LevelKey,
    pub value: KeyValue,
}

/// One OR branch of a hierarchy restriction: an ancestor path prefix
/// plus an IN list at the leaf level. `KeyValue::Null` entries render
/// as IS NULL branches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MemberGroup {
    pub prefix: Vec<PrefixEq>,
    pub level: LevelKey,
    pub values: Vec<KeyValue>,
}

/// All member restrictions on one hierarchy: the OR of its groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyRestriction {
    pub hierarchy: HierarchyKey,
    pub groups: Vec<MemberGroup>,
}

/// Subtree grants one role contributes for one hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleFilter {
    pub hierarchy: HierarchyKey,
    /// Granted subtree roots, expressed as groups. Rows below a root
    /// satisfy its group because ancestor columns repeat per row.
    pub groups: Vec<MemberGroup>,
    pub rollup: RollupPolicy,
    /// Whether the hierarchy is on the read target. Full-rollup grants
    /// off the target filter members only, never fact rows.
    pub on_target: bool,
}

impl RoleFilter {
    /// Whether the grant restricts the fact scan, not just member lists.
    pub fn scopes_fact(&self) -> bool {
        self.on_target || self.rollup == RollupPolicy::Partial
    }
}

/// Value filter applied after grouping. Grouped dimension columns are
/// legal alongside aggregates, so regex matches live here too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HavingFilter {
    Compare {
        measure: MeasureKey,
        op: CompareOp,
        value: f64,
    },
    /// Regex on the leaf caption of one level.
    Matches { level: LevelKey, pattern: String },
    Not(Box<HavingFilter>),
    And(Vec<HavingFilter>),
    Or(Vec<HavingFilter>),
}

impl HavingFilter {
    /// Whether any leaf compares a measure, which forces the fact join.
    pub fn references_measures(&self) -> bool {
        match self {
            HavingFilter::Compare { .. } => true,
            HavingFilter::Matches { .. } => false,
            HavingFilter::Not(inner) => inner.references_measures(),
            HavingFilter::And(parts) | HavingFilter::Or(parts) => {
                parts.iter().any(HavingFilter::references_measures)
            }
        }
    }
}

/// Row bound pushed down as ORDER BY + LIMIT.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bound {
    pub limit: u64,
    pub order: Option<OrderBy>,
}

/// Measure ordering for a bounded read. NULLs always sort last.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    pub measure: MeasureKey,
    pub desc: bool,
}

/// The content-hashable restriction set of one native read.
#[derive(Debug, Clone, Serialize)]
pub struct SqlConstraint {
    /// Cube the read runs against, by name.
    pub cube: String,
    /// Member restrictions per hierarchy: the target axis's explicit
    /// lists plus context members of non-target hierarchies.
    pub restrictions: Vec<HierarchyRestriction>,
    pub role: Vec<RoleFilter>,
    pub having: Option<HavingFilter>,
    pub non_empty: bool,
    /// Join dimension tables to the fact table even when nothing
    /// restricts fact rows.
    pub join_to_fact: bool,
    /// Measures scoping the read, sorted. Drives virtual-cube fan-out
    /// and the non-empty probe column.
    pub measures: Vec<MeasureKey>,
    pub bound: Option<Bound>,
}

impl SqlConstraint {
    /// A constraint with no restrictions at all, for plain member reads.
    pub fn unrestricted(cube: impl Into<String>) -> Self {
        Self {
            cube: cube.into(),
            restrictions: Vec::new(),
            role: Vec::new(),
            having: None,
            non_empty: false,
            join_to_fact: false,
            measures: Vec::new(),
            bound: None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.restrictions.is_empty()
            && self.role.is_empty()
            && self.having.is_none()
            && !self.non_empty
            && !self.join_to_fact
            && self.bound.is_none()
    }

    /// Whether the fact table participates in the generated SQL.
    pub fn needs_fact(&self) -> bool {
        self.non_empty
            || self.join_to_fact
            || self
                .having
                .as_ref()
                .map(HavingFilter::references_measures)
                .unwrap_or(false)
            || self
                .bound
                .as_ref()
                .map(|b| b.order.is_some())
                .unwrap_or(false)
    }

    /// Put every list in canonical order so equal content always
    /// fingerprints equal, regardless of build order.
    pub fn canonicalize(&mut self) {
        for restriction in &mut self.restrictions {
            for group in &mut restriction.groups {
                group.values.sort();
                group.values.dedup();
            }
            restriction.groups.sort();
            restriction.groups.dedup();
        }
        self.restrictions.sort_by(|a, b| a.hierarchy.cmp(&b.hierarchy));
        for filter in &mut self.role {
            filter.groups.sort();
        }
        self.role.sort_by(|a, b| a.hierarchy.cmp(&b.hierarchy));
        self.measures.sort();
        self.measures.dedup();
    }

    pub fn fingerprint(&self) -> NativeResult<Fingerprint> {
        Ok(Fingerprint::of(self)?)
    }
}
