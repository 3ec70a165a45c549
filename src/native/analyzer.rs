//! Set analysis: decides whether an axis expression can become a SQL
//! read, and flattens it into crossjoin arguments when it can.
//!
//! The analyzer never touches the database. It classifies an axis into
//! one of three outcomes: a native plan, a silent in-memory fallback, or
//! a blocked explicit-native function (which the dispatcher reports per
//! the configured alert policy).

use std::collections::BTreeSet;

use crate::constraint::{Bound, OrderBy};
use crate::expr::{AxisExpr, NumericExpr, Predicate, SetExpr};
use crate::model::context::EvalContext;
use crate::model::hierarchy::LevelId;
use crate::model::member::{CalcExpansion, MemberId, MemberKind};

use super::crossjoin::CrossJoinArg;

/// What the analyzer decided for one axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    /// The axis reads natively with this plan.
    Native(NativePlan),
    /// The axis evaluates in memory; nothing to report.
    NotNative,
    /// An explicitly native function cannot push down. The dispatcher
    /// applies the alert policy before falling back.
    Blocked { function: String, reason: String },
}

/// Which native entry point produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// A plain member enumeration (level, children, explicit list).
    MemberList,
    CrossJoin,
    Filter,
    TopCount,
}

/// A flattened native read, ready for constraint building.
#[derive(Debug, Clone, PartialEq)]
pub struct NativePlan {
    pub kind: NativeKind,
    pub args: Vec<CrossJoinArg>,
    /// Translatable filter predicate, for `Filter` plans.
    pub predicate: Option<Predicate>,
    /// Row bound, for `TopCount` plans.
    pub bound: Option<Bound>,
    pub non_empty: bool,
}

/// Pattern-matches axis expressions against the native-evaluable shapes.
pub struct SetAnalyzer<'a, 'b> {
    ctx: &'b EvalContext<'a>,
}

impl<'a, 'b> SetAnalyzer<'a, 'b> {
    pub fn new(ctx: &'b EvalContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn analyze(&self, axis: &AxisExpr) -> Analysis {
        let config = self.ctx.config;
        // The axis flag and the surrounding context both impose non-empty
        // semantics; either one puts the read under NON EMPTY.
        let non_empty = axis.non_empty || self.ctx.non_empty;
        match &axis.set {
            SetExpr::NonEmptyCrossJoin(..) => {
                if !config.enable_native_cross_join {
                    return Analysis::NotNative;
                }
                self.explicit("NonEmptyCrossJoin", NativeKind::CrossJoin, &axis.set, true)
            }
            SetExpr::CrossJoin(..) => {
                // A plain product with no NON EMPTY context is formed in
                // memory from the (cacheable) per-argument member lists.
                if !non_empty {
                    return Analysis::NotNative;
                }
                if !config.enable_native_non_empty {
                    return Analysis::NotNative;
                }
                self.explicit("Crossjoin", NativeKind::CrossJoin, &axis.set, true)
            }
            SetExpr::Filter { input, predicate } => {
                if !config.enable_native_filter {
                    return Analysis::NotNative;
                }
                self.analyze_filter(input, predicate, non_empty)
            }
            SetExpr::TopCount {
                input,
                count,
                order_by,
            } => {
                if !config.enable_native_top_count {
                    return Analysis::NotNative;
                }
                self.analyze_top_count(input, *count, order_by.as_ref(), non_empty)
            }
            SetExpr::Unsupported { .. } => Analysis::NotNative,
            _ => self.analyze_enumeration(&axis.set, non_empty),
        }
    }

    /// Plain enumerations: level members, children, explicit lists.
    fn analyze_enumeration(&self, set: &SetExpr, non_empty: bool) -> Analysis {
        if non_empty && !self.ctx.config.enable_native_non_empty {
            return Analysis::NotNative;
        }
        let args = match self.normalize(set) {
            Ok(args) => args,
            // Nothing explicitly native was requested, so stay silent.
            Err(_) => return Analysis::NotNative,
        };
        match self.check_args(&args) {
            Ok(()) => Analysis::Native(NativePlan {
                kind: NativeKind::MemberList,
                args,
                predicate: None,
                bound: None,
                non_empty,
            }),
            Err(_) => Analysis::NotNative,
        }
    }

    /// An explicitly native function: failures block with a reason.
    fn explicit(
        &self,
        function: &str,
        kind: NativeKind,
        set: &SetExpr,
        non_empty: bool,
    ) -> Analysis {
        let args = match self.normalize(set) {
            Ok(args) => args,
            Err(reason) => return self.blocked(function, reason),
        };
        if let Err(reason) = self.check_args(&args) {
            return self.blocked(function, reason);
        }
        Analysis::Native(NativePlan {
            kind,
            args,
            predicate: None,
            bound: None,
            non_empty,
        })
    }

    fn analyze_filter(&self, input: &SetExpr, predicate: &Predicate, non_empty: bool) -> Analysis {
        let args = match self.normalize(input) {
            Ok(args) => args,
            Err(reason) => return self.blocked("Filter", reason),
        };
        if let Err(reason) = self.check_args(&args) {
            return self.blocked("Filter", reason);
        }
        if !predicate.is_translatable() {
            return self.blocked("Filter", "predicate is not expressible in SQL".to_string());
        }
        if let Err(reason) = self.check_predicate(predicate, &args) {
            return self.blocked("Filter", reason);
        }
        Analysis::Native(NativePlan {
            kind: NativeKind::Filter,
            args,
            predicate: Some(predicate.clone()),
            bound: None,
            non_empty: non_empty || contains_non_empty(input),
        })
    }

    fn analyze_top_count(
        &self,
        input: &SetExpr,
        count: u64,
        order_by: Option<&NumericExpr>,
        non_empty: bool,
    ) -> Analysis {
        let args = match self.normalize(input) {
            Ok(args) => args,
            Err(reason) => return self.blocked("TopCount", reason),
        };
        if let Err(reason) = self.check_args(&args) {
            return self.blocked("TopCount", reason);
        }
        let order = match order_by {
            None => None,
            // Ranking by a constant keeps the input order.
            Some(NumericExpr::Literal(_)) => None,
            Some(NumericExpr::Measure(measure)) => {
                if self.ctx.catalog.measure(self.ctx.cube, measure).is_none() {
                    return self.blocked(
                        "TopCount",
                        format!("measure {} is not in cube {}", measure, self.cube_name()),
                    );
                }
                Some(OrderBy {
                    measure: measure.clone(),
                    desc: true,
                })
            }
            Some(NumericExpr::Opaque(display)) => {
                return self.blocked(
                    "TopCount",
                    format!("ranking expression {} is not expressible in SQL", display),
                )
            }
        };
        Analysis::Native(NativePlan {
            kind: NativeKind::TopCount,
            args,
            predicate: None,
            bound: Some(Bound {
                limit: count,
                order,
            }),
            non_empty: non_empty || contains_non_empty(input),
        })
    }

    fn blocked(&self, function: &str, reason: String) -> Analysis {
        Analysis::Blocked {
            function: function.to_string(),
            reason,
        }
    }

    fn cube_name(&self) -> &str {
        self.ctx.catalog.cube_name(self.ctx.cube)
    }

    // ===== Argument normalization =====

    fn normalize(&self, set: &SetExpr) -> Result<Vec<CrossJoinArg>, String> {
        match set {
            SetExpr::Members(members) => Ok(vec![self.normalize_members(members)?]),
            SetExpr::LevelMembers(level) => Ok(vec![CrossJoinArg::Level { level: *level }]),
            SetExpr::Children(member) => Ok(vec![self.normalize_children(*member)?]),
            SetExpr::Descendants { member, level } => {
                Ok(vec![self.normalize_descendants(*member, *level)?])
            }
            SetExpr::Tuples(rows) => self.factor_tuples(rows),
            SetExpr::CrossJoin(left, right) | SetExpr::NonEmptyCrossJoin(left, right) => {
                let mut args = self.normalize(left)?;
                args.extend(self.normalize(right)?);
                Ok(args)
            }
            SetExpr::Filter { .. } => Err("nested Filter cannot be flattened".to_string()),
            SetExpr::TopCount { .. } => Err("nested TopCount cannot be flattened".to_string()),
            SetExpr::Unsupported { function, .. } => {
                Err(format!("{} has no native translation", function))
            }
        }
    }

    /// An explicit list must reduce to stored members of one level of
    /// one hierarchy. Calculated members expand first when the
    /// ExpandNonNative behavior is on.
    fn normalize_members(&self, members: &[MemberId]) -> Result<CrossJoinArg, String> {
        let arena = self.ctx.catalog.arena();
        let mut stored: Vec<MemberId> = Vec::with_capacity(members.len());
        for &id in members {
            match &arena.get(id).kind {
                MemberKind::Regular => stored.push(id),
                MemberKind::All => {
                    return Err("the All member cannot be key-restricted".to_string())
                }
                MemberKind::Calculated(_) | MemberKind::CompoundSlicer(_) => {
                    if !self.ctx.config.expand_non_native {
                        return Err(format!(
                            "calculated member {} in a native set",
                            arena.get(id).key
                        ));
                    }
                    match arena.expand(id) {
                        CalcExpansion::Members(expanded) => {
                            for e in expanded {
                                if !arena.get(e).is_stored() {
                                    return Err(format!(
                                        "member {} does not expand to stored members",
                                        arena.get(id).key
                                    ));
                                }
                                stored.push(e);
                            }
                        }
                        CalcExpansion::Opaque(_) => {
                            return Err(format!(
                                "calculated member {} does not expand to stored members",
                                arena.get(id).key
                            ))
                        }
                    }
                }
            }
        }

        let first = stored
            .first()
            .copied()
            .ok_or_else(|| "empty member list".to_string())?;
        let hierarchy = arena.get(first).hierarchy;
        let level = arena
            .get(first)
            .level
            .ok_or_else(|| "member has no stored level".to_string())?;
        for &id in &stored {
            if arena.get(id).hierarchy != hierarchy {
                return Err("member list spans multiple hierarchies".to_string());
            }
            if arena.get(id).level != Some(level) {
                return Err("member list spans multiple levels".to_string());
            }
        }
        // Both paths answer with distinct rows, so a repeated member
        // adds nothing; dropping it here keeps the arg count exact.
        let mut seen = BTreeSet::new();
        stored.retain(|id| seen.insert(*id));
        Ok(CrossJoinArg::Members {
            hierarchy,
            level,
            members: stored,
        })
    }

    fn normalize_children(&self, parent: MemberId) -> Result<CrossJoinArg, String> {
        let member = self.ctx.catalog.member(parent);
        match member.kind {
            // Children of the All member are just the first level.
            MemberKind::All => {
                let hierarchy = self.ctx.catalog.hierarchy(member.hierarchy);
                match hierarchy.level_at_depth(1) {
                    Some(level) => Ok(CrossJoinArg::Level { level }),
                    None => Err(format!("hierarchy {} has no levels", hierarchy.key)),
                }
            }
            MemberKind::Regular => Ok(CrossJoinArg::Children { parent }),
            _ => Err(format!("calculated member {} has no children", member.key)),
        }
    }

    fn normalize_descendants(
        &self,
        ancestor: MemberId,
        level: LevelId,
    ) -> Result<CrossJoinArg, String> {
        let member = self.ctx.catalog.member(ancestor);
        let target = self.ctx.catalog.level(level);
        if target.hierarchy != member.hierarchy {
            return Err("descendants level is on a different hierarchy".to_string());
        }
        match member.kind {
            // Descendants of All at a level is the whole level.
            MemberKind::All => Ok(CrossJoinArg::Level { level }),
            MemberKind::Regular if target.depth > member.depth => {
                Ok(CrossJoinArg::Descendants { ancestor, level })
            }
            MemberKind::Regular => {
                Err("descendants level is not below the member".to_string())
            }
            _ => Err(format!("calculated member {} has no descendants", member.key)),
        }
    }

    /// An explicit tuple list is native only when it factors into
    /// independent per-position member lists (a full cartesian product).
    fn factor_tuples(&self, rows: &[Vec<MemberId>]) -> Result<Vec<CrossJoinArg>, String> {
        let arity = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| "empty tuple list".to_string())?;
        if rows.iter().any(|row| row.len() != arity) {
            return Err("tuple list has inconsistent arity".to_string());
        }

        let mut columns: Vec<Vec<MemberId>> = vec![Vec::new(); arity];
        for row in rows {
            for (position, &member) in row.iter().enumerate() {
                if !columns[position].contains(&member) {
                    columns[position].push(member);
                }
            }
        }
        let product: usize = columns.iter().map(Vec::len).product();
        if product != rows.len() {
            return Err("tuple list does not factor into a full product".to_string());
        }

        columns
            .iter()
            .map(|column| self.normalize_members(column))
            .collect()
    }

    // ===== Plan-level checks =====

    fn check_args(&self, args: &[CrossJoinArg]) -> Result<(), String> {
        let catalog = self.ctx.catalog;
        let mut hierarchies = Vec::with_capacity(args.len());
        for arg in args {
            let hierarchy = arg.hierarchy(catalog);
            if hierarchies.contains(&hierarchy) {
                return Err(format!(
                    "hierarchy {} appears in more than one argument",
                    catalog.hierarchy(hierarchy).key
                ));
            }
            hierarchies.push(hierarchy);
        }

        let bases = catalog.base_cubes_for(self.ctx.cube, &self.ctx.measure_scope);
        if bases.is_empty() {
            return Err(format!(
                "no base cube of {} carries the requested measures",
                self.cube_name()
            ));
        }
        for base in bases {
            for &hierarchy in &hierarchies {
                if !base.has_hierarchy(hierarchy) {
                    return Err(format!(
                        "hierarchy {} is not conformed in cube {}",
                        catalog.hierarchy(hierarchy).key,
                        base.name
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_predicate(&self, predicate: &Predicate, args: &[CrossJoinArg]) -> Result<(), String> {
        let catalog = self.ctx.catalog;
        match predicate {
            Predicate::Compare { left, right, .. } => {
                for side in [left, right] {
                    if let NumericExpr::Measure(measure) = side {
                        if catalog.measure(self.ctx.cube, measure).is_none() {
                            return Err(format!(
                                "measure {} is not in cube {}",
                                measure,
                                self.cube_name()
                            ));
                        }
                    }
                }
                Ok(())
            }
            Predicate::Matches { hierarchy, .. } => {
                if args.iter().any(|a| a.hierarchy(catalog) == *hierarchy) {
                    Ok(())
                } else {
                    Err(format!(
                        "match hierarchy {} is not on the filtered set",
                        catalog.hierarchy(*hierarchy).key
                    ))
                }
            }
            Predicate::Not(inner) => self.check_predicate(inner, args),
            Predicate::And(l, r) | Predicate::Or(l, r) => {
                self.check_predicate(l, args)?;
                self.check_predicate(r, args)
            }
        }
    }
}

fn contains_non_empty(set: &SetExpr) -> bool {
    match set {
        SetExpr::NonEmptyCrossJoin(..) => true,
        SetExpr::CrossJoin(left, right) => contains_non_empty(left) || contains_non_empty(right),
        SetExpr::Filter { input, .. } | SetExpr::TopCount { input, .. } => {
            contains_non_empty(input)
        }
        _ => false,
    }
}
