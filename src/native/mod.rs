//! Native evaluation: analysis, dispatch and events.
//!
//! [`NativeEvaluator`] is the crate's front door. Per axis it runs the
//! [`SetAnalyzer`], builds a constraint for native plans, consults the
//! result cache, and either executes the generated SQL or hands the
//! axis to the in-memory evaluator. Both paths produce the same
//! [`TupleList`], deduplicated and canonically ordered, so callers
//! never observe which one answered.
//!
//! Fallback is silent for ordinary sets. For explicitly native
//! functions it follows the configured alert policy: ignore, emit one
//! warning event, or abort the statement.

pub mod analyzer;
pub mod crossjoin;
pub mod events;

pub use analyzer::{Analysis, NativeKind, NativePlan, SetAnalyzer};
pub use crossjoin::CrossJoinArg;
pub use events::{CollectingSink, NativeEvent, NativeEventSink, NoopSink};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{ResultCache, TupleList};
use crate::config::AlertPolicy;
use crate::constraint::{
    BuildOutcome, ConstraintBuilder, Fingerprint, NativeRequest, TargetSlot,
};
use crate::error::{NativeError, NativeResult};
use crate::eval::{sort_canonical, InMemoryEvaluator};
use crate::expr::AxisExpr;
use crate::model::catalog::Catalog;
use crate::model::context::EvalContext;
use crate::model::member::{MemberId, MemberKey};
use crate::sql::{RowShape, SqlExecutionError, SqlExecutor, SqlRequest, SqlRow, SqlValue};
use crate::store::CellReader;

/// Evaluates axes natively where possible, in memory otherwise.
pub struct NativeEvaluator<'a> {
    executor: &'a dyn SqlExecutor,
    reader: &'a dyn CellReader,
    cache: &'a ResultCache,
    sink: &'a dyn NativeEventSink,
}

impl<'a> NativeEvaluator<'a> {
    pub fn new(
        executor: &'a dyn SqlExecutor,
        reader: &'a dyn CellReader,
        cache: &'a ResultCache,
        sink: &'a dyn NativeEventSink,
    ) -> Self {
        Self {
            executor,
            reader,
            cache,
            sink,
        }
    }

    pub fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        axis: &AxisExpr,
    ) -> NativeResult<Arc<TupleList>> {
        match SetAnalyzer::new(ctx).analyze(axis) {
            Analysis::Native(plan) => self.native_read(ctx, axis, &plan),
            Analysis::NotNative => self.fall_back(ctx, axis),
            Analysis::Blocked { function, reason } => {
                self.blocked_fall_back(ctx, axis, function, reason)
            }
        }
    }

    fn native_read(
        &self,
        ctx: &EvalContext<'_>,
        axis: &AxisExpr,
        plan: &NativePlan,
    ) -> NativeResult<Arc<TupleList>> {
        let request = match ConstraintBuilder::new(ctx).build(plan) {
            BuildOutcome::Request(request) => request,
            BuildOutcome::Empty => {
                return Ok(Arc::new(TupleList::new(plan.args.len(), Vec::new())))
            }
            BuildOutcome::NotNative(reason) => {
                // Plain enumerations fall back without ceremony; only
                // explicitly native functions answer to the policy.
                return if plan.kind == NativeKind::MemberList {
                    self.fall_back(ctx, axis)
                } else {
                    self.blocked_fall_back(
                        ctx,
                        axis,
                        axis.set.function_name().to_string(),
                        reason,
                    )
                };
            }
        };

        let fingerprint = request.constraint.fingerprint()?;
        if let Some(hit) = self.cache.get(&request.target, &fingerprint) {
            self.sink.notify(NativeEvent::ServedFromCache);
            return Ok(hit);
        }
        self.sink.notify(NativeEvent::NativeSelected {
            function: axis.set.function_name().to_string(),
            kind: plan.kind,
        });

        ctx.cancel.check()?;
        if let Some(cap) = ctx.config.result_cap() {
            if let Some(expected) = expected_rows(ctx.catalog, plan, &request) {
                if expected > cap {
                    return Err(NativeError::ResultSizeExceeded {
                        attempted: expected,
                        cap,
                    });
                }
            }
        }
        let sql_request = SqlRequest {
            catalog: ctx.catalog,
            config: ctx.config,
            target: &request.target,
            constraint: &request.constraint,
        };
        let rows = self.executor.execute(&sql_request, self.sink)?;
        self.check_cap(ctx, rows.len())?;

        let shape = RowShape::for_target(ctx.catalog, &request.target)?;
        let mut resolved = resolve_rows(ctx.catalog, &shape, &rows)?;
        // Bounded reads keep the engine's ranked order; everything else
        // is reordered canonically regardless of how the rows arrived.
        if request.constraint.bound.is_none() {
            sort_canonical(ctx.catalog, &mut resolved);
        }

        // A cancelled statement must not seed the shared cache.
        ctx.cancel.check()?;
        let list = to_tuple_list(ctx.catalog, request.target.arity(), &resolved);
        let list = self
            .cache
            .put(request.target.clone(), fingerprint.clone(), list);
        self.seed_children(ctx.catalog, &request, &fingerprint, &resolved);
        Ok(list)
    }

    fn fall_back(&self, ctx: &EvalContext<'_>, axis: &AxisExpr) -> NativeResult<Arc<TupleList>> {
        let rows = InMemoryEvaluator::new(ctx, self.reader).evaluate(axis)?;
        self.check_cap(ctx, rows.len())?;
        let arity = rows
            .first()
            .map(Vec::len)
            .unwrap_or_else(|| axis.set.hierarchies(ctx.catalog).len());
        Ok(Arc::new(to_tuple_list(ctx.catalog, arity, &rows)))
    }

    fn blocked_fall_back(
        &self,
        ctx: &EvalContext<'_>,
        axis: &AxisExpr,
        function: String,
        reason: String,
    ) -> NativeResult<Arc<TupleList>> {
        match ctx.config.alert_native_evaluation_unsupported {
            AlertPolicy::Error => {
                Err(NativeError::UnsupportedNativeEvaluation { function, reason })
            }
            AlertPolicy::Warn => {
                self.sink
                    .notify(NativeEvent::FallbackWarning { function, reason });
                self.fall_back(ctx, axis)
            }
            AlertPolicy::Off => self.fall_back(ctx, axis),
        }
    }

    fn check_cap(&self, ctx: &EvalContext<'_>, rows: usize) -> NativeResult<()> {
        if let Some(cap) = ctx.config.result_cap() {
            if rows as u64 > cap {
                return Err(NativeError::ResultSizeExceeded {
                    attempted: rows as u64,
                    cap,
                });
            }
        }
        Ok(())
    }

    /// Seed children entries from a complete single-level read. Every
    /// returned member sits under its parent, so each parent's group is
    /// that parent's full child list under the same constraint.
    fn seed_children(
        &self,
        catalog: &Catalog,
        request: &NativeRequest,
        fingerprint: &Fingerprint,
        resolved: &[Vec<MemberId>],
    ) {
        if request.constraint.bound.is_some() || request.target.arity() != 1 {
            return;
        }
        if !matches!(request.target.slots().first(), Some(TargetSlot::Level(_))) {
            return;
        }
        let Some(first) = resolved.first() else {
            return;
        };
        // A restricted list is not a complete level, and its entries
        // could never be asked for as children anyway.
        let hierarchy_key = &catalog.hierarchy(catalog.member(first[0]).hierarchy).key;
        if request
            .constraint
            .restrictions
            .iter()
            .any(|r| &r.hierarchy == hierarchy_key)
        {
            return;
        }
        let mut groups: BTreeMap<MemberId, Vec<MemberKey>> = BTreeMap::new();
        for tuple in resolved {
            let member = catalog.member(tuple[0]);
            let Some(parent) = member.parent else {
                continue;
            };
            if catalog.member(parent).is_all() {
                continue;
            }
            groups.entry(parent).or_default().push(member.key.clone());
        }
        self.cache.populate_children(
            fingerprint,
            groups.into_iter().map(|(parent, children)| {
                (
                    catalog.member(parent).key.clone(),
                    TupleList::of_members(children),
                )
            }),
        );
    }
}

/// Row count of a read whose result is exactly the product of its
/// argument lists, known before any SQL runs. Probes, role grants,
/// fact joins and snowflake reachability all shrink results, so such
/// reads are only checked after execution.
fn expected_rows(catalog: &Catalog, plan: &NativePlan, request: &NativeRequest) -> Option<u64> {
    let constraint = &request.constraint;
    if plan.kind != NativeKind::MemberList
        || constraint.non_empty
        || constraint.join_to_fact
        || constraint.bound.is_some()
        || !constraint.role.is_empty()
    {
        return None;
    }
    if plan
        .args
        .iter()
        .any(|arg| !catalog.hierarchy(arg.hierarchy(catalog)).joins.is_empty())
    {
        return None;
    }
    plan.args.iter().try_fold(1u64, |product, arg| {
        arg.known_cardinality(catalog)
            .and_then(|n| product.checked_mul(n))
    })
}

/// Map result rows back onto arena members. Each slot's columns hold
/// the root-to-slot key chain, so resolution walks children level by
/// level; a NULL key matches the ragged members stored with NULL keys.
fn resolve_rows(
    catalog: &Catalog,
    shape: &RowShape,
    rows: &[SqlRow],
) -> Result<Vec<Vec<MemberId>>, SqlExecutionError> {
    let arena = catalog.arena();
    let mut resolved = Vec::with_capacity(rows.len());
    for row in rows {
        let mut tuple = Vec::with_capacity(shape.slots.len());
        let mut index = 0;
        for slot in &shape.slots {
            let hierarchy = catalog.hierarchy(slot.hierarchy);
            let mut current = hierarchy.all_member;
            for &level_id in &slot.levels {
                let value = row
                    .get(index)
                    .map(SqlValue::to_key_value)
                    .ok_or_else(|| {
                        SqlExecutionError::Execution(
                            "result row is narrower than its shape".to_string(),
                        )
                    })?;
                index += 1;
                let candidates = match current {
                    Some(parent) => arena.children_of(parent),
                    None => arena.members_at_level(level_id),
                };
                let found = candidates
                    .iter()
                    .copied()
                    .find(|&id| arena.get(id).key_value == value);
                let Some(found) = found else {
                    return Err(SqlExecutionError::UnknownKey {
                        level: catalog.level(level_id).key.to_string(),
                        value: value.to_string(),
                    });
                };
                current = Some(found);
            }
            let member = current.ok_or_else(|| {
                SqlExecutionError::Lowering(format!(
                    "target slot of {} has no levels",
                    hierarchy.key
                ))
            })?;
            tuple.push(member);
        }
        resolved.push(tuple);
    }
    Ok(resolved)
}

fn to_tuple_list(catalog: &Catalog, arity: usize, rows: &[Vec<MemberId>]) -> TupleList {
    TupleList::new(
        arity,
        rows.iter()
            .map(|tuple| {
                tuple
                    .iter()
                    .map(|&id| catalog.member(id).key.clone())
                    .collect()
            })
            .collect(),
    )
}
