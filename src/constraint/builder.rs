//! Builds the SQL constraint for one native plan.
//!
//! The builder folds three sources into one [`SqlConstraint`]: the
//! target arguments themselves (explicit member lists), the evaluation
//! context (current members and slicer, minus target hierarchies), and
//! the access role. The target axis is authoritative for its own
//! hierarchies, so a context member on a target hierarchy is dropped
//! rather than intersected.

use std::collections::BTreeMap;

use crate::expr::{CompareOp, NumericExpr, Predicate};
use crate::model::catalog::Catalog;
use crate::model::context::EvalContext;
use crate::model::hierarchy::{HierarchyId, HierarchyKey};
use crate::model::member::{CalcExpansion, MemberId};
use crate::model::role::{HierarchyAccess, RollupPolicy};
use crate::native::analyzer::NativePlan;
use crate::native::crossjoin::CrossJoinArg;

use super::{
    CacheTarget, HavingFilter, HierarchyRestriction, MemberGroup, PrefixEq, RoleFilter,
    SqlConstraint,
};

/// A buildable native read: the cache/read target plus its constraint.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub target: CacheTarget,
    pub constraint: SqlConstraint,
}

/// What constraint building concluded.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Request(NativeRequest),
    /// The context excludes every row; answer empty without SQL.
    Empty,
    /// The plan is not expressible after all; falls back with a reason.
    NotNative(String),
}

pub struct ConstraintBuilder<'a, 'b> {
    ctx: &'b EvalContext<'a>,
}

impl<'a, 'b> ConstraintBuilder<'a, 'b> {
    pub fn new(ctx: &'b EvalContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn build(&self, plan: &NativePlan) -> BuildOutcome {
        let catalog = self.ctx.catalog;
        let mut constraint = SqlConstraint::unrestricted(catalog.cube_name(self.ctx.cube));
        constraint.non_empty = plan.non_empty;
        constraint.measures = self.ctx.measure_scope.clone();

        if let Some(bound) = &plan.bound {
            if bound.limit == 0 {
                return BuildOutcome::Empty;
            }
            if let Some(order) = &bound.order {
                constraint.measures.push(order.measure.clone());
                if !plan.non_empty && plan.args.len() > 1 {
                    return BuildOutcome::NotNative(
                        "measure-ranked tuples need a non-empty context".to_string(),
                    );
                }
                if !plan.non_empty {
                    constraint.join_to_fact = true;
                }
            }
            constraint.bound = Some(bound.clone());
        }

        if let Some(predicate) = &plan.predicate {
            let having = match self.translate_predicate(predicate, &plan.args) {
                Ok(having) => having,
                Err(reason) => return BuildOutcome::NotNative(reason),
            };
            if having.references_measures() {
                if !plan.non_empty {
                    return BuildOutcome::NotNative(
                        "measure filter needs a non-empty context".to_string(),
                    );
                }
                collect_measures(&having, &mut constraint.measures);
            }
            constraint.having = Some(having);
        }

        // Without the fact table there is nothing to relate the
        // hierarchies, so a multi-position read has no single SELECT.
        if plan.args.len() > 1 && !constraint.needs_fact() {
            return BuildOutcome::NotNative(
                "a multi-hierarchy set needs a non-empty context".to_string(),
            );
        }

        // Target arguments: slots plus the axis's own restrictions.
        let mut slots = Vec::with_capacity(plan.args.len());
        let mut target_hierarchies = Vec::with_capacity(plan.args.len());
        for arg in &plan.args {
            let hierarchy = arg.hierarchy(catalog);
            target_hierarchies.push(hierarchy);
            slots.push(arg.target_slot(catalog));
            match arg {
                CrossJoinArg::Members { level, members, .. } => {
                    let visible = self.visible_members(hierarchy, members);
                    if visible.is_empty() {
                        return BuildOutcome::Empty;
                    }
                    match self.group_members(&visible) {
                        Err(reason) => return BuildOutcome::NotNative(reason),
                        // The list covers the whole hierarchy; no filter.
                        Ok(Groups::Unrestricted) => {}
                        Ok(Groups::Of(groups)) => {
                            if let Some(reason) = self.over_limit(&groups) {
                                return BuildOutcome::NotNative(reason);
                            }
                            // A whole-level list needs no restriction.
                            let level_key = &catalog.level(*level).key;
                            let whole = groups.iter().any(|g| {
                                g.prefix.is_empty()
                                    && g.level == *level_key
                                    && g.values.len()
                                        == catalog.arena().members_at_level(*level).len()
                            });
                            if !whole {
                                constraint.restrictions.push(HierarchyRestriction {
                                    hierarchy: catalog.hierarchy(hierarchy).key.clone(),
                                    groups,
                                });
                            }
                        }
                    }
                }
                CrossJoinArg::Children { parent } => {
                    if arg.level(catalog).is_none() {
                        // Bottom-level member: no children exist.
                        return BuildOutcome::Empty;
                    }
                    let _ = parent;
                }
                CrossJoinArg::Level { .. } | CrossJoinArg::Descendants { .. } => {}
            }
        }

        // Member and ranked selects walk the snowflake chain with inner
        // joins rooted at the primary table, which drops members whose
        // branch reaches no primary row. With the childless filter off,
        // the in-memory evaluator keeps those members, and the answers
        // differ. Non-empty reads drop them on both paths.
        if !constraint.non_empty && !self.ctx.config.filter_childless_snowflake_members {
            for arg in &plan.args {
                let hierarchy = catalog.hierarchy(arg.hierarchy(catalog));
                let at_bottom = arg
                    .level(catalog)
                    .map(|id| catalog.level(id).depth == hierarchy.levels.len())
                    .unwrap_or(true);
                if !hierarchy.joins.is_empty() && !at_bottom {
                    return BuildOutcome::NotNative(format!(
                        "members of {} above the leaf level depend on the childless filter",
                        hierarchy.key
                    ));
                }
            }
        }

        // Context members scope the fact rows, so they only matter when
        // the fact table participates. The target axis is authoritative
        // for its own hierarchies: conflicting context members drop.
        if constraint.non_empty || constraint.join_to_fact {
            for (hierarchy_key, member) in self.ctx.current_members() {
                let hierarchy = catalog.member(member).hierarchy;
                if target_hierarchies.contains(&hierarchy) {
                    continue;
                }
                if catalog.member(member).is_all() {
                    continue;
                }
                match catalog.arena().expand(member) {
                    CalcExpansion::Members(list) => {
                        if list.is_empty() {
                            return BuildOutcome::Empty;
                        }
                        match self.group_members(&list) {
                            Err(reason) => return BuildOutcome::NotNative(reason),
                            Ok(Groups::Unrestricted) => {}
                            Ok(Groups::Of(groups)) => {
                                if let Some(reason) = self.over_limit(&groups) {
                                    return BuildOutcome::NotNative(reason);
                                }
                                constraint.restrictions.push(HierarchyRestriction {
                                    hierarchy: hierarchy_key.clone(),
                                    groups,
                                });
                            }
                        }
                    }
                    CalcExpansion::Opaque(value) => {
                        return BuildOutcome::NotNative(format!(
                            "context member {} does not expand to stored members ({})",
                            catalog.member(member).key, value.display
                        ));
                    }
                }
            }
        }

        // Role grants.
        if let Some(role) = self.ctx.role {
            for h in catalog.hierarchies() {
                let on_target = target_hierarchies.contains(&h.id);
                let restricted = constraint
                    .restrictions
                    .iter()
                    .any(|r| r.hierarchy == h.key);
                let access = role.access(&h.key);
                // A partial-rollup grant hides the fact rows of hidden
                // members, so it scopes any fact-joined read even when
                // nothing else touches the hierarchy.
                let scopes_fact_rows = matches!(
                    access,
                    HierarchyAccess::Custom { rollup: RollupPolicy::Partial, .. }
                ) && (constraint.non_empty || constraint.join_to_fact)
                    && catalog.cube_covers(self.ctx.cube, &[h.id]);
                if !(on_target || restricted || scopes_fact_rows) {
                    continue;
                }
                match access {
                    HierarchyAccess::All => {}
                    HierarchyAccess::None => return BuildOutcome::Empty,
                    HierarchyAccess::Custom { allowed, rollup } => {
                        if allowed.is_empty() {
                            return BuildOutcome::Empty;
                        }
                        let fact_involved = constraint.non_empty || constraint.join_to_fact;
                        if *rollup == RollupPolicy::Full && on_target && fact_involved {
                            return BuildOutcome::NotNative(format!(
                                "full-rollup grant on {} needs in-memory evaluation",
                                h.key
                            ));
                        }
                        if *rollup == RollupPolicy::Full && !on_target {
                            // Totals include hidden members; no filter.
                            continue;
                        }
                        let groups = match self.group_members(allowed) {
                            Err(reason) => return BuildOutcome::NotNative(reason),
                            Ok(Groups::Unrestricted) => continue,
                            Ok(Groups::Of(groups)) => groups,
                        };
                        constraint.role.push(RoleFilter {
                            hierarchy: h.key.clone(),
                            groups,
                            rollup: *rollup,
                            on_target,
                        });
                    }
                }
            }
        }

        // A virtual cube fans out to one SELECT per base cube joined by
        // UNION. Row bounds and measure filters are per-branch there,
        // which changes the combined answer, so they stay in memory.
        if catalog.base_cubes_for(self.ctx.cube, &constraint.measures).len() > 1 {
            if constraint.bound.is_some() {
                return BuildOutcome::NotNative(
                    "a row bound does not combine with a multi-cube union".to_string(),
                );
            }
            let measure_having = constraint
                .having
                .as_ref()
                .map(HavingFilter::references_measures)
                .unwrap_or(false);
            if measure_having {
                return BuildOutcome::NotNative(
                    "a measure filter does not combine with a multi-cube union".to_string(),
                );
            }
        }

        constraint.canonicalize();
        BuildOutcome::Request(NativeRequest {
            target: CacheTarget(slots),
            constraint,
        })
    }

    /// Drop members the role cannot see. Explicit lists are filtered up
    /// front so hidden members never reach the constraint.
    fn visible_members(&self, hierarchy: HierarchyId, members: &[MemberId]) -> Vec<MemberId> {
        match self.ctx.role {
            None => members.to_vec(),
            Some(role) => {
                let key = &self.ctx.catalog.hierarchy(hierarchy).key;
                members
                    .iter()
                    .copied()
                    .filter(|m| role.can_see(self.ctx.catalog.arena(), key, *m))
                    .collect()
            }
        }
    }

    /// Group members by shared parent, then collapse any group that
    /// covers all of its parent's children into the parent itself.
    /// Collapsing all the way to the All member means no restriction.
    fn group_members(&self, members: &[MemberId]) -> Result<Groups, String> {
        let arena = self.ctx.catalog.arena();
        let mut buckets: BTreeMap<(Option<MemberId>, usize), Vec<MemberId>> = BTreeMap::new();
        for &m in members {
            let record = arena.get(m);
            buckets
                .entry((record.parent, record.depth))
                .or_default()
                .push(m);
        }

        loop {
            let mut collapsed = None;
            for ((parent, _), bucket) in &buckets {
                if let Some(p) = parent {
                    let children = arena.children_of(*p);
                    let complete = children.len() == bucket.len()
                        && children.iter().all(|c| bucket.contains(c));
                    if complete {
                        collapsed = Some(*p);
                        break;
                    }
                }
            }
            match collapsed {
                None => break,
                Some(p) => {
                    let record = arena.get(p);
                    buckets.remove(&(Some(p), record.depth + 1));
                    if record.is_all() {
                        return Ok(Groups::Unrestricted);
                    }
                    buckets
                        .entry((record.parent, record.depth))
                        .or_default()
                        .push(p);
                }
            }
        }

        let catalog = self.ctx.catalog;
        let groups = buckets
            .into_iter()
            .map(|((parent, depth), bucket)| {
                let hierarchy = catalog.hierarchy_of(bucket[0]);
                let level = hierarchy.level_at_depth(depth).ok_or_else(|| {
                    format!("members at depth {} are deeper than {}", depth, hierarchy.key)
                })?;
                let prefix = match parent {
                    Some(p) if !arena.get(p).is_all() => arena
                        .key_path(p)
                        .into_iter()
                        .zip(&hierarchy.levels)
                        .map(|(value, &ancestor)| PrefixEq {
                            level: catalog.level(ancestor).key.clone(),
                            value,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                Ok(MemberGroup {
                    prefix,
                    level: catalog.level(level).key.clone(),
                    values: bucket.iter().map(|m| arena.get(*m).key_value.clone()).collect(),
                })
            })
            .collect::<Result<_, String>>()?;
        Ok(Groups::Of(groups))
    }

    fn over_limit(&self, groups: &[MemberGroup]) -> Option<String> {
        let max = self.ctx.config.max_constraints;
        groups
            .iter()
            .find(|g| g.values.len() > max)
            .map(|g| format!("{} values at {} exceed MaxConstraints {}", g.values.len(), g.level, max))
    }

    // ===== Predicate translation =====

    fn translate_predicate(
        &self,
        predicate: &Predicate,
        args: &[CrossJoinArg],
    ) -> Result<HavingFilter, String> {
        match predicate {
            Predicate::Compare { left, op, right } => match (left, right) {
                (NumericExpr::Measure(measure), NumericExpr::Literal(value)) => {
                    Ok(HavingFilter::Compare {
                        measure: measure.clone(),
                        op: *op,
                        value: *value,
                    })
                }
                (NumericExpr::Literal(value), NumericExpr::Measure(measure)) => {
                    Ok(HavingFilter::Compare {
                        measure: measure.clone(),
                        op: op.flip(),
                        value: *value,
                    })
                }
                _ => Err("comparison is not measure-to-literal".to_string()),
            },
            Predicate::Matches { hierarchy, pattern } => {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(format!("invalid match pattern: {}", e));
                }
                let catalog = self.ctx.catalog;
                let arg = args
                    .iter()
                    .find(|a| a.hierarchy(catalog) == *hierarchy)
                    .ok_or_else(|| "match hierarchy is not on the filtered set".to_string())?;
                let level = arg
                    .level(catalog)
                    .ok_or_else(|| "match target has no level".to_string())?;
                Ok(HavingFilter::Matches {
                    level: catalog.level(level).key.clone(),
                    pattern: pattern.clone(),
                })
            }
            Predicate::Not(inner) => Ok(HavingFilter::Not(Box::new(
                self.translate_predicate(inner, args)?,
            ))),
            Predicate::And(l, r) => Ok(HavingFilter::And(vec![
                self.translate_predicate(l, args)?,
                self.translate_predicate(r, args)?,
            ])),
            Predicate::Or(l, r) => Ok(HavingFilter::Or(vec![
                self.translate_predicate(l, args)?,
                self.translate_predicate(r, args)?,
            ])),
        }
    }
}

enum Groups {
    /// The member set covers the whole hierarchy.
    Unrestricted,
    Of(Vec<MemberGroup>),
}

fn collect_measures(having: &HavingFilter, into: &mut Vec<crate::model::cube::MeasureKey>) {
    match having {
        HavingFilter::Compare { measure, .. } => {
            if !into.contains(measure) {
                into.push(measure.clone());
            }
        }
        HavingFilter::Matches { .. } => {}
        HavingFilter::Not(inner) => collect_measures(inner, into),
        HavingFilter::And(parts) | HavingFilter::Or(parts) => {
            for part in parts {
                collect_measures(part, into);
            }
        }
    }
}
