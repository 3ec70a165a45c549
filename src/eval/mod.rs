//! In-memory set evaluation.
//!
//! Every set shape evaluates here against the member arena, with cell
//! values read through [`CellReader`] wherever NON EMPTY, a measure
//! predicate or measure ranking needs them. Results come back deduped
//! and in canonical hierarchy order unless the axis is measure-ranked
//! at the root, so a caller cannot tell from the rows whether SQL or
//! this module answered.
//!
//! Emptiness mirrors the SQL probe: a tuple is empty when every scoped
//! measure's cell is absent. Comparison predicates use three-valued
//! logic, so a missing cell makes the comparison unknown and the tuple
//! drops even under `Not`, exactly as a NULL does in a WHERE clause.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use regex::Regex;

use crate::error::{NativeError, NativeResult};
use crate::expr::{AxisExpr, NumericExpr, Predicate, SetExpr};
use crate::model::catalog::Catalog;
use crate::model::context::EvalContext;
use crate::model::cube::MeasureKey;
use crate::model::hierarchy::{HierarchyId, LevelId};
use crate::model::member::{CalcExpansion, MemberId};
use crate::model::role::{HierarchyAccess, RollupPolicy};
use crate::sql::SqlExecutionError;
use crate::store::{CellReader, CellRequest};

// =============================================================================
// Canonical order
// =============================================================================

/// Canonical tuple order: position by position, the root-to-self
/// sibling ordinals of each member. Declaration order in the catalog
/// must match the level's SQL ordering columns for the two evaluation
/// paths to sort alike.
pub fn canonical_cmp(catalog: &Catalog, a: &[MemberId], b: &[MemberId]) -> Ordering {
    let arena = catalog.arena();
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = arena.ordinal_path(*x).cmp(&arena.ordinal_path(*y));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Sort tuples canonically, the order every unbounded read returns.
pub fn sort_canonical(catalog: &Catalog, rows: &mut [Vec<MemberId>]) {
    let arena = catalog.arena();
    rows.sort_by_cached_key(|tuple| {
        tuple
            .iter()
            .map(|&id| arena.ordinal_path(id))
            .collect::<Vec<_>>()
    });
}

/// Drop repeated tuples, keeping first occurrences, the way SELECT
/// DISTINCT collapses repeated key rows.
fn dedup_stable(rows: &mut Vec<Vec<MemberId>>) {
    let mut seen: HashSet<Vec<MemberId>> = HashSet::with_capacity(rows.len());
    rows.retain(|tuple| seen.insert(tuple.clone()));
}

// =============================================================================
// Evaluator
// =============================================================================

/// How one tuple pins the cell space once calculated members and the
/// surrounding context are folded in.
enum CellSpace {
    /// An opaque calculated member short-circuits the read; the cell is
    /// whatever value its body captured.
    Opaque(Option<f64>),
    At {
        coordinates: Vec<MemberId>,
        scopes: Vec<(HierarchyId, Vec<MemberId>)>,
    },
}

/// Three-valued predicate result; `Unknown` never keeps a tuple.
#[derive(Clone, Copy, PartialEq)]
enum Truth {
    True,
    False,
    Unknown,
}

pub struct InMemoryEvaluator<'a, 'b> {
    ctx: &'b EvalContext<'a>,
    reader: &'b dyn CellReader,
}

impl<'a, 'b> InMemoryEvaluator<'a, 'b> {
    pub fn new(ctx: &'b EvalContext<'a>, reader: &'b dyn CellReader) -> Self {
        Self { ctx, reader }
    }

    /// Evaluate one axis. A measure-ranked root keeps its rank order
    /// and applies NON EMPTY before the cut, like the generated ORDER
    /// BY + LIMIT does; everything else comes back canonical.
    pub fn evaluate(&self, axis: &AxisExpr) -> NativeResult<Vec<Vec<MemberId>>> {
        let non_empty = axis.non_empty || self.ctx.non_empty;
        if let SetExpr::TopCount {
            input,
            count,
            order_by,
        } = &axis.set
        {
            return self.top_rows(input, *count, order_by.as_ref(), non_empty);
        }
        let mut rows = self.evaluate_set(&axis.set)?;
        if non_empty {
            rows = self.retain_non_empty(rows)?;
        }
        dedup_stable(&mut rows);
        sort_canonical(self.ctx.catalog, &mut rows);
        Ok(rows)
    }

    fn evaluate_set(&self, set: &SetExpr) -> NativeResult<Vec<Vec<MemberId>>> {
        self.ctx.cancel.check()?;
        match set {
            SetExpr::Members(members) => Ok(self.member_rows(members)),
            SetExpr::LevelMembers(level) => Ok(self.level_rows(*level)),
            SetExpr::Children(parent) => Ok(self.children_rows(*parent)),
            SetExpr::Descendants { member, level } => Ok(self.descendant_rows(*member, *level)),
            SetExpr::Tuples(rows) => Ok(self.tuple_rows(rows)),
            SetExpr::CrossJoin(left, right) => self.cross_rows(left, right, false),
            SetExpr::NonEmptyCrossJoin(left, right) => self.cross_rows(left, right, true),
            SetExpr::Filter { input, predicate } => self.filter_rows(input, predicate),
            SetExpr::TopCount {
                input,
                count,
                order_by,
            } => self.top_rows(input, *count, order_by.as_ref(), false),
            SetExpr::Unsupported { function, .. } => {
                Err(NativeError::UnsupportedNativeEvaluation {
                    function: function.clone(),
                    reason: "the function has no evaluable translation".to_string(),
                })
            }
        }
    }

    // =========================================================================
    // Enumerations
    // =========================================================================

    /// An explicit list. Calculated members expand to their stored
    /// members only when ExpandNonNative is on, so both evaluation
    /// paths agree on what the list denotes.
    fn member_rows(&self, members: &[MemberId]) -> Vec<Vec<MemberId>> {
        let arena = self.ctx.catalog.arena();
        let mut rows = Vec::with_capacity(members.len());
        for &id in members {
            if !self.visible(id) {
                continue;
            }
            if self.ctx.config.expand_non_native && arena.get(id).is_calculated() {
                match arena.expand(id) {
                    CalcExpansion::Members(list) => {
                        rows.extend(
                            list.into_iter()
                                .filter(|&m| self.visible(m))
                                .map(|m| vec![m]),
                        );
                    }
                    CalcExpansion::Opaque(_) => rows.push(vec![id]),
                }
            } else {
                rows.push(vec![id]);
            }
        }
        rows
    }

    fn level_rows(&self, level: LevelId) -> Vec<Vec<MemberId>> {
        self.ctx
            .catalog
            .arena()
            .members_at_level(level)
            .iter()
            .copied()
            .filter(|&id| self.visible(id) && self.reaches_leaf(id))
            .map(|id| vec![id])
            .collect()
    }

    fn children_rows(&self, parent: MemberId) -> Vec<Vec<MemberId>> {
        self.ctx
            .catalog
            .arena()
            .children_of(parent)
            .iter()
            .copied()
            .filter(|&id| self.ctx.catalog.member(id).is_stored())
            .filter(|&id| self.visible(id) && self.reaches_leaf(id))
            .map(|id| vec![id])
            .collect()
    }

    /// Members at `level` inside the ancestor's subtree. A calculated
    /// or compound ancestor has no stored subtree.
    fn descendant_rows(&self, ancestor: MemberId, level: LevelId) -> Vec<Vec<MemberId>> {
        let catalog = self.ctx.catalog;
        let record = catalog.member(ancestor);
        if record.is_calculated() || record.is_compound_slicer() {
            return Vec::new();
        }
        let target = catalog.level(level);
        if target.hierarchy != record.hierarchy || target.depth < record.depth {
            return Vec::new();
        }
        if target.depth == record.depth {
            return if record.level == Some(level) {
                vec![vec![ancestor]]
            } else {
                Vec::new()
            };
        }
        let arena = catalog.arena();
        arena
            .members_at_level(level)
            .iter()
            .copied()
            .filter(|&id| arena.is_descendant_of(id, ancestor))
            .filter(|&id| self.visible(id) && self.reaches_leaf(id))
            .map(|id| vec![id])
            .collect()
    }

    /// Explicit tuples pass through; a tuple with a hidden member drops
    /// whole, the way the filtered factor lists drop its combinations.
    fn tuple_rows(&self, rows: &[Vec<MemberId>]) -> Vec<Vec<MemberId>> {
        rows.iter()
            .filter(|tuple| tuple.iter().all(|&id| self.visible(id)))
            .cloned()
            .collect()
    }

    fn cross_rows(
        &self,
        left: &SetExpr,
        right: &SetExpr,
        non_empty: bool,
    ) -> NativeResult<Vec<Vec<MemberId>>> {
        let left_rows = self.evaluate_set(left)?;
        let right_rows = self.evaluate_set(right)?;
        let mut rows = Vec::with_capacity(left_rows.len() * right_rows.len());
        for l in &left_rows {
            self.ctx.cancel.check()?;
            for r in &right_rows {
                let mut tuple = l.clone();
                tuple.extend(r.iter().copied());
                rows.push(tuple);
            }
        }
        if non_empty {
            rows = self.retain_non_empty(rows)?;
        }
        Ok(rows)
    }

    // =========================================================================
    // Filtering and ranking
    // =========================================================================

    fn filter_rows(
        &self,
        input: &SetExpr,
        predicate: &Predicate,
    ) -> NativeResult<Vec<Vec<MemberId>>> {
        let rows = self.evaluate_set(input)?;
        let mut kept = Vec::new();
        for tuple in rows {
            self.ctx.cancel.check()?;
            if self.truth_of(predicate, &tuple)? == Truth::True {
                kept.push(tuple);
            }
        }
        Ok(kept)
    }

    fn truth_of(&self, predicate: &Predicate, tuple: &[MemberId]) -> NativeResult<Truth> {
        Ok(match predicate {
            Predicate::Compare { left, op, right } => {
                match (
                    self.numeric_value(left, tuple)?,
                    self.numeric_value(right, tuple)?,
                ) {
                    (Some(l), Some(r)) => {
                        if op.matches(l, r) {
                            Truth::True
                        } else {
                            Truth::False
                        }
                    }
                    _ => Truth::Unknown,
                }
            }
            Predicate::Matches { hierarchy, pattern } => {
                let member = tuple
                    .iter()
                    .copied()
                    .find(|&id| self.ctx.catalog.member(id).hierarchy == *hierarchy)
                    .or_else(|| self.ctx.member_or_default(*hierarchy));
                let regex = Regex::new(pattern).map_err(|err| {
                    SqlExecutionError::Execution(format!(
                        "invalid match pattern {}: {}",
                        pattern, err
                    ))
                })?;
                match member {
                    Some(id) if regex.is_match(&self.ctx.catalog.member(id).caption) => {
                        Truth::True
                    }
                    _ => Truth::False,
                }
            }
            Predicate::Not(inner) => match self.truth_of(inner, tuple)? {
                Truth::True => Truth::False,
                Truth::False => Truth::True,
                Truth::Unknown => Truth::Unknown,
            },
            Predicate::And(left, right) => {
                match (self.truth_of(left, tuple)?, self.truth_of(right, tuple)?) {
                    (Truth::False, _) | (_, Truth::False) => Truth::False,
                    (Truth::True, Truth::True) => Truth::True,
                    _ => Truth::Unknown,
                }
            }
            Predicate::Or(left, right) => {
                match (self.truth_of(left, tuple)?, self.truth_of(right, tuple)?) {
                    (Truth::True, _) | (_, Truth::True) => Truth::True,
                    (Truth::False, Truth::False) => Truth::False,
                    _ => Truth::Unknown,
                }
            }
        })
    }

    fn numeric_value(
        &self,
        expr: &NumericExpr,
        tuple: &[MemberId],
    ) -> NativeResult<Option<f64>> {
        match expr {
            NumericExpr::Literal(value) => Ok(Some(*value)),
            NumericExpr::Measure(measure) => self.tuple_cell(tuple, measure),
            NumericExpr::Opaque(display) => Err(NativeError::UnsupportedNativeEvaluation {
                function: "Filter".to_string(),
                reason: format!("value expression {} is not evaluable", display),
            }),
        }
    }

    /// Rank by the measure descending with empties last, canonical
    /// order breaking ties, then cut. NON EMPTY and DISTINCT apply
    /// before the cut, matching the statement a bounded read compiles
    /// into. Without a ranking measure the input order stands.
    fn top_rows(
        &self,
        input: &SetExpr,
        count: u64,
        order_by: Option<&NumericExpr>,
        non_empty: bool,
    ) -> NativeResult<Vec<Vec<MemberId>>> {
        let mut rows = self.evaluate_set(input)?;
        if non_empty {
            rows = self.retain_non_empty(rows)?;
        }
        dedup_stable(&mut rows);
        match order_by {
            None | Some(NumericExpr::Literal(_)) => {}
            Some(NumericExpr::Measure(measure)) => {
                let mut keyed = Vec::with_capacity(rows.len());
                for tuple in rows {
                    self.ctx.cancel.check()?;
                    let value = self.tuple_cell(&tuple, measure)?;
                    keyed.push((value, tuple));
                }
                keyed.sort_by(|(a, ta), (b, tb)| {
                    rank_desc(a, b).then_with(|| canonical_cmp(self.ctx.catalog, ta, tb))
                });
                rows = keyed.into_iter().map(|(_, tuple)| tuple).collect();
            }
            Some(NumericExpr::Opaque(display)) => {
                return Err(NativeError::UnsupportedNativeEvaluation {
                    function: "TopCount".to_string(),
                    reason: format!("ranking expression {} is not evaluable", display),
                })
            }
        }
        rows.truncate(count as usize);
        Ok(rows)
    }

    // =========================================================================
    // Cells
    // =========================================================================

    /// The cell one tuple denotes under the current context, for the
    /// given measure.
    pub fn tuple_cell(
        &self,
        tuple: &[MemberId],
        measure: &MeasureKey,
    ) -> NativeResult<Option<f64>> {
        match self.cell_space(tuple) {
            CellSpace::Opaque(value) => Ok(value),
            CellSpace::At {
                coordinates,
                scopes,
            } => {
                let request = CellRequest {
                    catalog: self.ctx.catalog,
                    cube: self.ctx.cube,
                    measure,
                    coordinates: &coordinates,
                    scopes: &scopes,
                };
                Ok(self.reader.cell(&request)?)
            }
        }
    }

    /// Keep tuples some scoped measure has a cell for, the OR shape of
    /// the SQL non-empty probe.
    fn retain_non_empty(&self, rows: Vec<Vec<MemberId>>) -> NativeResult<Vec<Vec<MemberId>>> {
        let measures = self.probe_measures();
        let mut kept = Vec::with_capacity(rows.len());
        for tuple in rows {
            self.ctx.cancel.check()?;
            if !self.tuple_is_empty(&tuple, &measures)? {
                kept.push(tuple);
            }
        }
        Ok(kept)
    }

    fn probe_measures(&self) -> Vec<MeasureKey> {
        if !self.ctx.measure_scope.is_empty() {
            return self.ctx.measure_scope.clone();
        }
        self.ctx.probe_measure().into_iter().collect()
    }

    fn tuple_is_empty(
        &self,
        tuple: &[MemberId],
        measures: &[MeasureKey],
    ) -> NativeResult<bool> {
        match self.cell_space(tuple) {
            CellSpace::Opaque(value) => Ok(value.is_none()),
            CellSpace::At {
                coordinates,
                scopes,
            } => {
                for measure in measures {
                    let request = CellRequest {
                        catalog: self.ctx.catalog,
                        cube: self.ctx.cube,
                        measure,
                        coordinates: &coordinates,
                        scopes: &scopes,
                    };
                    if !self.reader.is_empty(&request)? {
                        return Ok(false);
                    }
                }
                Ok(!measures.is_empty())
            }
        }
    }

    /// Fold the tuple and the evaluation context into a cell space. The
    /// tuple is authoritative for its own hierarchies; context members
    /// fill the rest. Calculated members expand to a point, a scope, or
    /// an opaque value; partial-rollup grants scope every read of a
    /// hierarchy the cube covers.
    fn cell_space(&self, tuple: &[MemberId]) -> CellSpace {
        let catalog = self.ctx.catalog;
        let arena = catalog.arena();

        let mut by_hierarchy: BTreeMap<HierarchyId, MemberId> = BTreeMap::new();
        for (_, member) in self.ctx.current_members() {
            by_hierarchy.insert(catalog.member(member).hierarchy, member);
        }
        for &member in tuple {
            by_hierarchy.insert(catalog.member(member).hierarchy, member);
        }

        let mut coordinates = Vec::new();
        let mut scopes = Vec::new();
        for (hierarchy, member) in by_hierarchy {
            if catalog.member(member).is_all() {
                continue;
            }
            match arena.expand(member) {
                CalcExpansion::Members(list) => match list.as_slice() {
                    [] => return CellSpace::Opaque(None),
                    [one] if catalog.member(*one).is_all() => {}
                    [one] => coordinates.push(*one),
                    _ => scopes.push((hierarchy, list)),
                },
                CalcExpansion::Opaque(value) => return CellSpace::Opaque(value.value),
            }
        }

        if let Some(role) = self.ctx.role {
            for h in catalog.hierarchies() {
                if let HierarchyAccess::Custom {
                    allowed,
                    rollup: RollupPolicy::Partial,
                } = role.access(&h.key)
                {
                    if catalog.cube_covers(self.ctx.cube, &[h.id]) {
                        scopes.push((h.id, allowed.clone()));
                    }
                }
            }
        }

        CellSpace::At {
            coordinates,
            scopes,
        }
    }

    // =========================================================================
    // Member filters
    // =========================================================================

    /// Role visibility applies to stored members; calculated members
    /// and All members are access-controlled by their hierarchy, not by
    /// member grants.
    fn visible(&self, id: MemberId) -> bool {
        let Some(role) = self.ctx.role else {
            return true;
        };
        let member = self.ctx.catalog.member(id);
        if !member.is_stored() {
            return true;
        }
        let key = &self.ctx.catalog.hierarchy(member.hierarchy).key;
        role.can_see(self.ctx.catalog.arena(), key, id)
    }

    /// With the childless filter on, a snowflake member above the leaf
    /// level only exists if some leaf descends from it, matching what
    /// the leaf-outward dimension join returns.
    fn reaches_leaf(&self, id: MemberId) -> bool {
        if !self.ctx.config.filter_childless_snowflake_members {
            return true;
        }
        let catalog = self.ctx.catalog;
        let member = catalog.member(id);
        let hierarchy = catalog.hierarchy(member.hierarchy);
        if hierarchy.joins.is_empty() || member.depth >= hierarchy.levels.len() {
            return true;
        }
        self.has_leaf_descendant(id, hierarchy.levels.len())
    }

    fn has_leaf_descendant(&self, id: MemberId, leaf_depth: usize) -> bool {
        let arena = self.ctx.catalog.arena();
        arena.children_of(id).iter().any(|&child| {
            arena.get(child).depth == leaf_depth || self.has_leaf_descendant(child, leaf_depth)
        })
    }
}

fn rank_desc(a: &Option<f64>, b: &Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
