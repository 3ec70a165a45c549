//! Constraint building over the grocery schema: how target lists,
//! context members and role grants land in the restriction set, and
//! which combinations refuse to push down.

mod fixture;

use fixture::{measure, Fixture, UNIT_SALES, WAREHOUSE_SALES};
use opal::config::NativeConfig;
use opal::constraint::{
    BuildOutcome, CacheTarget, ConstraintBuilder, MemberGroup, NativeRequest, PrefixEq,
};
use opal::expr::{AxisExpr, CompareOp, NumericExpr, Predicate, SetExpr};
use opal::model::{
    EvalContext, HierarchyAccess, HierarchyKey, KeyValue, LevelKey, Role, RollupPolicy,
};
use opal::native::{Analysis, SetAnalyzer};

fn build(ctx: &EvalContext<'_>, axis: &AxisExpr) -> BuildOutcome {
    let plan = match SetAnalyzer::new(ctx).analyze(axis) {
        Analysis::Native(plan) => plan,
        other => panic!("expected a native plan, got {:?}", other),
    };
    ConstraintBuilder::new(ctx).build(&plan)
}

fn request(outcome: BuildOutcome) -> NativeRequest {
    match outcome {
        BuildOutcome::Request(request) => request,
        other => panic!("expected a request, got {:?}", other),
    }
}

fn not_native(outcome: BuildOutcome) -> String {
    match outcome {
        BuildOutcome::NotNative(reason) => reason,
        other => panic!("expected a fallback, got {:?}", other),
    }
}

fn customer_group(prefix: &[(&str, &str)], level: &str, values: Vec<KeyValue>) -> MemberGroup {
    MemberGroup {
        prefix: prefix
            .iter()
            .map(|(level, value)| PrefixEq {
                level: LevelKey(level.to_string()),
                value: KeyValue::Str(value.to_string()),
            })
            .collect(),
        level: LevelKey(level.to_string()),
        values,
    }
}

// ===== Targets and context =====

#[test]
fn test_plain_level_read_is_unrestricted() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config);

    let request = request(build(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
    ));
    assert_eq!(
        request.target,
        CacheTarget::level(LevelKey("[Time].[Quarter]".to_string()))
    );
    assert!(request.constraint.is_unrestricted());
    assert!(!request.constraint.needs_fact());
}

#[test]
fn test_context_scopes_only_non_target_hierarchies() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx
        .ctx(&config)
        .with_slicer([
            fx.member("[Store].[Canada]"),
            fx.member("[Customers].[USA].[WA].[Seattle].[Jeanne Bradley]"),
        ])
        .with_member(fx.member("[Time].[1997].[Q1]"))
        .with_measure(measure(UNIT_SALES));

    let request = request(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
    ));
    let hierarchies: Vec<&str> = request
        .constraint
        .restrictions
        .iter()
        .map(|r| r.hierarchy.as_str())
        .collect();
    // The slicer's Customers member conflicts with the target axis and
    // drops; the remaining slicer member and the current Time member
    // both scope the fact rows.
    assert_eq!(hierarchies, vec!["[Store]", "[Time]"]);
    assert!(request.constraint.non_empty);
}

#[test]
fn test_plain_read_ignores_context() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config).with_slicer([fx.member("[Store].[Canada]")]);

    let request = request(build(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
    ));
    assert!(request.constraint.is_unrestricted());
}

// ===== Member grouping =====

#[test]
fn test_city_siblings_group_with_ancestor_prefix() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config);

    let request = request(build(
        &ctx,
        &AxisExpr::new(SetExpr::Members(vec![
            fx.member("[Customers].[USA].[WA].[Seattle].[Jeanne Bradley]"),
            fx.member("[Customers].[USA].[WA].[Seattle].[Jeanne Deri]"),
            fx.member("[Customers].[USA].[WA].[Spokane].[Mary Price]"),
        ])),
    ));

    let restriction = &request.constraint.restrictions[0];
    assert_eq!(restriction.hierarchy, HierarchyKey("[Customers]".to_string()));
    assert_eq!(
        restriction.groups,
        vec![
            customer_group(
                &[
                    ("[Customers].[Country]", "USA"),
                    ("[Customers].[State]", "WA"),
                    ("[Customers].[City]", "Seattle"),
                ],
                "[Customers].[Customer]",
                vec![KeyValue::Int(6), KeyValue::Int(7)],
            ),
            customer_group(
                &[
                    ("[Customers].[Country]", "USA"),
                    ("[Customers].[State]", "WA"),
                    ("[Customers].[City]", "Spokane"),
                ],
                "[Customers].[Customer]",
                vec![KeyValue::Int(16)],
            ),
        ]
    );
}

#[test]
fn test_complete_sibling_set_collapses_to_parent() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config);
    let seattle: Vec<_> = [
        "Jeanne Bradley",
        "Jeanne Deri",
        "Jeanne Derry",
        "Jeanne Ellis",
        "Jeanne Fernandez",
        "Jeanne McDill",
        "Jeanne Turner",
        "Jeannette Bura",
        "Jeannette Eldridge",
        "Adam Reynolds",
    ]
    .iter()
    .map(|name| fx.member(&format!("[Customers].[USA].[WA].[Seattle].[{}]", name)))
    .collect();

    let request = request(build(&ctx, &AxisExpr::new(SetExpr::Members(seattle))));
    assert_eq!(
        request.constraint.restrictions[0].groups,
        vec![customer_group(
            &[
                ("[Customers].[Country]", "USA"),
                ("[Customers].[State]", "WA"),
            ],
            "[Customers].[City]",
            vec![KeyValue::Str("Seattle".to_string())],
        )]
    );
}

#[test]
fn test_compound_slicer_collapses_to_year() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx
        .ctx(&config)
        .with_slicer([fx.member("[Time].[H1 1997]")])
        .with_measure(measure(UNIT_SALES));

    let request = request(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
    ));
    let time = request
        .constraint
        .restrictions
        .iter()
        .find(|r| r.hierarchy.as_str() == "[Time]")
        .expect("time restriction");
    // Q1 and Q2 are all of 1997's children, so the pair becomes the year.
    assert_eq!(
        time.groups,
        vec![MemberGroup {
            prefix: Vec::new(),
            level: LevelKey("[Time].[Year]".to_string()),
            values: vec![KeyValue::Int(1997)],
        }]
    );
}

#[test]
fn test_opaque_context_member_defeats_pushdown() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx
        .ctx(&config)
        .with_slicer([fx.member("[Time].[Time Forecast]")]);

    let reason = not_native(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
    ));
    assert!(reason.contains("[Time].[Time Forecast]"), "{}", reason);
}

#[test]
fn test_max_constraints_bounds_group_size() {
    let fx = Fixture::new();
    let config = NativeConfig {
        max_constraints: 1,
        ..NativeConfig::default()
    };
    let ctx = fx.ctx(&config);

    let reason = not_native(build(
        &ctx,
        &AxisExpr::new(SetExpr::Members(vec![
            fx.member("[Customers].[USA].[WA].[Seattle].[Jeanne Bradley]"),
            fx.member("[Customers].[USA].[WA].[Seattle].[Jeanne Deri]"),
        ])),
    ));
    assert!(reason.contains("MaxConstraints"), "{}", reason);
}

#[test]
fn test_children_of_leaf_member_answer_empty() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config);

    let outcome = build(
        &ctx,
        &AxisExpr::new(SetExpr::Children(
            fx.member("[Product].[Drink].[Alcohol].[Amber Ale]"),
        )),
    );
    assert!(matches!(outcome, BuildOutcome::Empty));
}

// ===== Role grants =====

#[test]
fn test_partial_grant_scopes_fact_reads_off_target() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let role = fx.wa_partial();
    let ctx = fx
        .ctx(&config)
        .with_role(&role)
        .with_measure(measure(UNIT_SALES));

    let request = request(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Product].[Family]"))),
    ));
    assert_eq!(request.constraint.role.len(), 1);
    let filter = &request.constraint.role[0];
    assert_eq!(filter.hierarchy, HierarchyKey("[Customers]".to_string()));
    assert_eq!(filter.rollup, RollupPolicy::Partial);
    assert!(!filter.on_target);
    assert!(filter.scopes_fact());
    assert_eq!(
        filter.groups,
        vec![customer_group(
            &[("[Customers].[Country]", "USA")],
            "[Customers].[State]",
            vec![KeyValue::Str("WA".to_string())],
        )]
    );
}

#[test]
fn test_full_grant_off_target_adds_no_filter() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let role = fx.usa_only();
    let ctx = fx
        .ctx(&config)
        .with_role(&role)
        .with_measure(measure(UNIT_SALES));

    let request = request(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Product].[Family]"))),
    ));
    // Full rollup keeps hidden members in the totals, so fact rows stay
    // unfiltered off the target axis.
    assert!(request.constraint.role.is_empty());
}

#[test]
fn test_full_grant_on_target_blocks_fact_reads() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let role = fx.usa_only();
    let ctx = fx.ctx(&config).with_role(&role);
    let customers = SetExpr::LevelMembers(fx.level("[Customers].[Customer]"));

    let reason = not_native(build(&ctx, &AxisExpr::non_empty(customers.clone())));
    assert!(
        reason.contains("full-rollup grant on [Customers]"),
        "{}",
        reason
    );

    // Without the fact join the grant is a plain member filter.
    let request = request(build(&ctx, &AxisExpr::new(customers)));
    assert_eq!(request.constraint.role.len(), 1);
    assert!(request.constraint.role[0].on_target);
    assert!(!request.constraint.role[0].scopes_fact());
}

#[test]
fn test_none_grant_answers_empty() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let mut role = Role::new("no_products");
    role.grant(
        HierarchyKey("[Product]".to_string()),
        HierarchyAccess::None,
    );
    let ctx = fx.ctx(&config).with_role(&role);

    let outcome = build(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Product].[Family]"))),
    );
    assert!(matches!(outcome, BuildOutcome::Empty));
}

// ===== Bounds, measures and virtual cubes =====

#[test]
fn test_measure_ranked_bound_joins_fact() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx(&config);

    let request = request(build(
        &ctx,
        &AxisExpr::new(SetExpr::TopCount {
            input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
            count: 4,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
    ));
    let constraint = &request.constraint;
    assert!(constraint.join_to_fact, "empty members must keep their rank rows");
    assert!(constraint.needs_fact());
    let bound = constraint.bound.as_ref().expect("bound");
    assert_eq!(bound.limit, 4);
    let order = bound.order.as_ref().expect("order");
    assert_eq!(order.measure, measure(UNIT_SALES));
    assert!(order.desc);
    assert!(constraint.measures.contains(&measure(UNIT_SALES)));
}

#[test]
fn test_virtual_union_rejects_bounds_and_measure_filters() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx
        .ctx_for(&config, "Sales and Warehouse")
        .with_measure(measure(UNIT_SALES))
        .with_measure(measure(WAREHOUSE_SALES));
    let names = SetExpr::LevelMembers(fx.level("[Product].[Name]"));

    let reason = not_native(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::TopCount {
            input: Box::new(names.clone()),
            count: 2,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
    ));
    assert!(
        reason.contains("row bound does not combine with a multi-cube union"),
        "{}",
        reason
    );

    let reason = not_native(build(
        &ctx,
        &AxisExpr::non_empty(SetExpr::Filter {
            input: Box::new(names),
            predicate: Predicate::Compare {
                left: NumericExpr::Measure(measure(UNIT_SALES)),
                op: CompareOp::Gt,
                right: NumericExpr::Literal(5.0),
            },
        }),
    ));
    assert!(
        reason.contains("measure filter does not combine with a multi-cube union"),
        "{}",
        reason
    );
}

#[test]
fn test_rebuilt_constraint_fingerprints_identically() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Customers].[Customer]")));

    let fingerprint_with = |slicer: Option<&str>| {
        let mut ctx = fx.ctx(&config).with_measure(measure(UNIT_SALES));
        if let Some(member) = slicer {
            ctx = ctx.with_slicer([fx.member(member)]);
        }
        request(build(&ctx, &axis)).constraint.fingerprint().unwrap()
    };

    let first = fingerprint_with(Some("[Time].[1997].[Q1]"));
    let second = fingerprint_with(Some("[Time].[1997].[Q1]"));
    assert_eq!(first, second, "the same context always hashes the same");
    assert_ne!(
        first,
        fingerprint_with(None),
        "a slicer must never satisfy an unsliced read"
    );
}
