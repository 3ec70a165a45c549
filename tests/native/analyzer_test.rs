//! Analyzer outcomes over the grocery schema: which sets plan
//! natively, which fall back silently, and which block with a reason.

mod fixture;

use fixture::{measure, Fixture, UNIT_SALES};
use opal::config::NativeConfig;
use opal::constraint::Bound;
use opal::expr::{AxisExpr, CompareOp, NumericExpr, Predicate, SetExpr};
use opal::model::HierarchyKey;
use opal::native::{Analysis, CrossJoinArg, NativeKind, NativePlan, SetAnalyzer};

fn analyze(fx: &Fixture, config: &NativeConfig, axis: &AxisExpr) -> Analysis {
    let ctx = fx.ctx(config);
    SetAnalyzer::new(&ctx).analyze(axis)
}

fn native_plan(analysis: Analysis) -> NativePlan {
    match analysis {
        Analysis::Native(plan) => plan,
        other => panic!("expected a native plan, got {:?}", other),
    }
}

fn blocked(analysis: Analysis) -> (String, String) {
    match analysis {
        Analysis::Blocked { function, reason } => (function, reason),
        other => panic!("expected a blocked analysis, got {:?}", other),
    }
}

// ===== Enumerations =====

#[test]
fn test_quarter_level_read_plans_member_list() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let quarter = fx.level("[Time].[Quarter]");

    let plan = native_plan(analyze(
        &fx,
        &config,
        &AxisExpr::new(SetExpr::LevelMembers(quarter)),
    ));
    assert_eq!(plan.kind, NativeKind::MemberList);
    assert_eq!(plan.args, vec![CrossJoinArg::Level { level: quarter }]);
    assert!(plan.predicate.is_none());
    assert!(plan.bound.is_none());
    assert!(!plan.non_empty);
}

#[test]
fn test_explicit_quarter_list_keeps_member_ids() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let q1 = fx.member("[Time].[1997].[Q1]");
    let q2 = fx.member("[Time].[1997].[Q2]");

    let plan = native_plan(analyze(
        &fx,
        &config,
        &AxisExpr::non_empty(SetExpr::Members(vec![q1, q2])),
    ));
    assert!(plan.non_empty);
    match &plan.args[..] {
        [CrossJoinArg::Members { level, members, .. }] => {
            assert_eq!(*level, fx.level("[Time].[Quarter]"));
            assert_eq!(members, &vec![q1, q2]);
        }
        other => panic!("unexpected args {:?}", other),
    }
}

#[test]
fn test_list_spanning_levels_falls_back_silently() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::Members(vec![
        fx.member("[Time].[1997]"),
        fx.member("[Time].[1997].[Q1]"),
    ]));

    assert_eq!(analyze(&fx, &config, &axis), Analysis::NotNative);
}

#[test]
fn test_compound_member_in_list_needs_expansion() {
    let fx = Fixture::new();
    let h1 = fx.member("[Time].[H1 1997]");
    let axis = AxisExpr::new(SetExpr::Members(vec![h1]));

    let config = NativeConfig::default();
    assert_eq!(analyze(&fx, &config, &axis), Analysis::NotNative);

    let config = NativeConfig {
        expand_non_native: true,
        ..NativeConfig::default()
    };
    let plan = native_plan(analyze(&fx, &config, &axis));
    match &plan.args[..] {
        [CrossJoinArg::Members { members, .. }] => {
            assert_eq!(
                members,
                &vec![
                    fx.member("[Time].[1997].[Q1]"),
                    fx.member("[Time].[1997].[Q2]"),
                ]
            );
        }
        other => panic!("unexpected args {:?}", other),
    }
}

#[test]
fn test_descendants_of_all_reads_whole_level() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let all = fx
        .catalog
        .hierarchy_by_key(&HierarchyKey("[Customers]".to_string()))
        .and_then(|h| h.all_member)
        .unwrap();
    let city = fx.level("[Customers].[City]");

    let plan = native_plan(analyze(
        &fx,
        &config,
        &AxisExpr::new(SetExpr::Descendants {
            member: all,
            level: city,
        }),
    ));
    assert_eq!(plan.args, vec![CrossJoinArg::Level { level: city }]);
    assert_eq!(plan.kind, NativeKind::MemberList);
}

// ===== Explicit native functions =====

#[test]
fn test_virtual_cube_conformance_follows_measure_scope() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::non_empty_crossjoin(
        SetExpr::LevelMembers(fx.level("[Time].[Quarter]")),
        SetExpr::LevelMembers(fx.level("[Customers].[Country]")),
    ));

    // Both bases answer an unscoped read, and Customers is absent from
    // the Warehouse cube.
    let ctx = fx.ctx_for(&config, "Sales and Warehouse");
    let (function, reason) = blocked(SetAnalyzer::new(&ctx).analyze(&axis));
    assert_eq!(function, "NonEmptyCrossJoin");
    assert!(reason.contains("not conformed"), "{}", reason);

    let ctx = ctx.with_measure(measure(UNIT_SALES));
    assert!(matches!(
        SetAnalyzer::new(&ctx).analyze(&axis),
        Analysis::Native(_)
    ));
}

#[test]
fn test_unsupported_argument_blocks_explicit_crossjoin() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::non_empty_crossjoin(
        SetExpr::Unsupported {
            function: "Head".to_string(),
            args: vec![SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))],
        },
        SetExpr::LevelMembers(fx.level("[Product].[Family]")),
    ));

    let (function, reason) = blocked(analyze(&fx, &config, &axis));
    assert_eq!(function, "NonEmptyCrossJoin");
    assert!(reason.contains("Head has no native translation"), "{}", reason);
}

#[test]
fn test_match_predicate_must_cover_its_hierarchy() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::Filter {
        input: Box::new(SetExpr::LevelMembers(fx.level("[Product].[Family]"))),
        predicate: Predicate::Matches {
            hierarchy: fx.hierarchy("[Customers]"),
            pattern: "(?i)^jeanne".to_string(),
        },
    });

    let (function, reason) = blocked(analyze(&fx, &config, &axis));
    assert_eq!(function, "Filter");
    assert!(reason.contains("is not on the filtered set"), "{}", reason);
}

#[test]
fn test_filter_measure_outside_cube_blocks() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let ctx = fx.ctx_for(&config, "Warehouse");
    let axis = AxisExpr::non_empty(SetExpr::Filter {
        input: Box::new(SetExpr::LevelMembers(fx.level("[Product].[Name]"))),
        predicate: Predicate::Compare {
            left: NumericExpr::Measure(measure(UNIT_SALES)),
            op: CompareOp::Gt,
            right: NumericExpr::Literal(1.0),
        },
    });

    let (function, reason) = blocked(SetAnalyzer::new(&ctx).analyze(&axis));
    assert_eq!(function, "Filter");
    assert!(reason.contains("is not in cube Warehouse"), "{}", reason);
}

#[test]
fn test_top_count_by_literal_keeps_input_order() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let plan = native_plan(analyze(
        &fx,
        &config,
        &AxisExpr::new(SetExpr::TopCount {
            input: Box::new(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
            count: 2,
            order_by: Some(NumericExpr::Literal(1.0)),
        }),
    ));

    assert_eq!(plan.kind, NativeKind::TopCount);
    assert_eq!(
        plan.bound,
        Some(Bound {
            limit: 2,
            order: None,
        })
    );
}

#[test]
fn test_top_count_by_opaque_expression_blocks() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::TopCount {
        input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
        count: 5,
        order_by: Some(NumericExpr::Opaque("Rank([Customers].CurrentMember)".to_string())),
    });

    let (function, reason) = blocked(analyze(&fx, &config, &axis));
    assert_eq!(function, "TopCount");
    assert!(reason.contains("not expressible in SQL"), "{}", reason);
}

#[test]
fn test_nested_filter_blocks_top_count() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let axis = AxisExpr::new(SetExpr::TopCount {
        input: Box::new(SetExpr::Filter {
            input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
            predicate: Predicate::Matches {
                hierarchy: fx.hierarchy("[Customers]"),
                pattern: "(?i)^jeanne".to_string(),
            },
        }),
        count: 5,
        order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
    });

    let (function, reason) = blocked(analyze(&fx, &config, &axis));
    assert_eq!(function, "TopCount");
    assert!(reason.contains("nested Filter"), "{}", reason);
}

#[test]
fn test_inner_non_empty_crossjoin_marks_plan() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let plan = native_plan(analyze(
        &fx,
        &config,
        &AxisExpr::new(SetExpr::TopCount {
            input: Box::new(SetExpr::non_empty_crossjoin(
                SetExpr::LevelMembers(fx.level("[Time].[Quarter]")),
                SetExpr::LevelMembers(fx.level("[Product].[Family]")),
            )),
            count: 3,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
    ));
    assert!(plan.non_empty, "inner NON EMPTY semantics reach the plan");
    assert_eq!(plan.args.len(), 2);
}

#[test]
fn test_context_non_empty_promotes_plain_product() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let set = SetExpr::crossjoin(
        SetExpr::LevelMembers(fx.level("[Time].[Quarter]")),
        SetExpr::LevelMembers(fx.level("[Product].[Family]")),
    );
    // On its own the product is formed in memory.
    assert!(matches!(
        analyze(&fx, &config, &AxisExpr::new(set.clone())),
        Analysis::NotNative
    ));

    // A context already under NON EMPTY carries the semantics in.
    let ctx = fx.ctx(&config).with_non_empty(true);
    let plan = native_plan(SetAnalyzer::new(&ctx).analyze(&AxisExpr::new(set)));
    assert_eq!(plan.kind, NativeKind::CrossJoin);
    assert!(plan.non_empty);
}

#[test]
fn test_feature_flags_silence_their_functions() {
    let fx = Fixture::new();
    let customer = fx.level("[Customers].[Customer]");

    let config = NativeConfig {
        enable_native_filter: false,
        ..NativeConfig::default()
    };
    let filtered = AxisExpr::new(SetExpr::Filter {
        input: Box::new(SetExpr::LevelMembers(customer)),
        predicate: Predicate::Matches {
            hierarchy: fx.hierarchy("[Customers]"),
            pattern: "(?i)^jeanne".to_string(),
        },
    });
    assert_eq!(analyze(&fx, &config, &filtered), Analysis::NotNative);

    let config = NativeConfig {
        enable_native_top_count: false,
        ..NativeConfig::default()
    };
    let ranked = AxisExpr::new(SetExpr::TopCount {
        input: Box::new(SetExpr::LevelMembers(customer)),
        count: 3,
        order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
    });
    assert_eq!(analyze(&fx, &config, &ranked), Analysis::NotNative);

    let config = NativeConfig {
        enable_native_non_empty: false,
        ..NativeConfig::default()
    };
    let non_empty = AxisExpr::non_empty(SetExpr::LevelMembers(customer));
    assert_eq!(analyze(&fx, &config, &non_empty), Analysis::NotNative);
}
