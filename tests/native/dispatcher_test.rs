//! Dispatcher behavior end to end: event reporting, alert policies,
//! result caps, aggregate substitution, virtual-cube unions and the
//! failure paths that must abort a statement.

mod fixture;

use fixture::{keys, leaves, measure, Fixture, STORE_SALES, UNIT_SALES, WAREHOUSE_SALES};
use opal::config::{AlertPolicy, NativeConfig};
use opal::error::NativeError;
use opal::expr::{AxisExpr, NumericExpr, Predicate, SetExpr};
use opal::model::{
    Aggregator, CancelToken, CatalogBuilder, Cube, DimensionUsage, EvalContext, HierarchySpec,
    KeyValue, LevelSpec, Measure, MeasureExpr,
};
use opal::native::{CollectingSink, NativeEvaluator, NativeEvent, NativeKind};
use opal::sql::SqlExecutionError;
use opal::store::SqliteStore;
use opal::ResultCache;

struct Run {
    cache: ResultCache,
    sink: CollectingSink,
}

impl Run {
    fn new() -> Run {
        Run {
            cache: ResultCache::new(),
            sink: CollectingSink::new(),
        }
    }

    fn evaluate(
        &self,
        fx: &Fixture,
        ctx: &EvalContext<'_>,
        axis: &AxisExpr,
    ) -> Result<std::sync::Arc<opal::TupleList>, NativeError> {
        NativeEvaluator::new(&fx.store, &fx.store, &self.cache, &self.sink).evaluate(ctx, axis)
    }
}

// ===== Events and policies =====

#[test]
fn test_native_read_reports_selection_then_sql() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();

    run.evaluate(
        &fx,
        &fx.ctx(&config),
        &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
    )
    .unwrap();

    let events = run.sink.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        NativeEvent::NativeSelected {
            function,
            kind: NativeKind::MemberList,
        } if function == "Members"
    ));
    assert!(matches!(&events[1], NativeEvent::ExecutingSql(_)));
}

#[test]
fn test_silent_fallback_emits_no_events() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();

    let list = run
        .evaluate(
            &fx,
            &fx.ctx(&config),
            &AxisExpr::new(SetExpr::Members(vec![
                fx.member("[Time].[1997]"),
                fx.member("[Time].[1997].[Q1]"),
            ])),
        )
        .unwrap();

    assert_eq!(list.len(), 2);
    assert!(run.sink.events().is_empty());
}

#[test]
fn test_warn_policy_reports_reason_and_recovers() {
    let fx = Fixture::new();
    let config = NativeConfig {
        alert_native_evaluation_unsupported: AlertPolicy::Warn,
        ..NativeConfig::default()
    };
    let run = Run::new();
    // A ranked cut inside Filter cannot flatten into one read.
    let axis = AxisExpr::new(SetExpr::Filter {
        input: Box::new(SetExpr::TopCount {
            input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
            count: 3,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
        predicate: Predicate::Matches {
            hierarchy: fx.hierarchy("[Customers]"),
            pattern: "(?i)^jeanne ".to_string(),
        },
    });

    let list = run.evaluate(&fx, &fx.ctx(&config), &axis).unwrap();

    assert_eq!(run.sink.warning_count(), 1);
    assert!(run.sink.events().iter().any(|event| matches!(
        event,
        NativeEvent::FallbackWarning { function, reason }
            if function == "Filter" && reason.contains("nested TopCount")
    )));
    assert_eq!(leaves(&list), vec!["Jeanne Bradley", "Jeanne Ellis"]);
    assert!(run.sink.executed_sql().is_empty());
}

#[test]
fn test_error_policy_aborts_instead_of_falling_back() {
    let fx = Fixture::new();
    let config = NativeConfig {
        alert_native_evaluation_unsupported: AlertPolicy::Error,
        ..NativeConfig::default()
    };
    let run = Run::new();
    let axis = AxisExpr::new(SetExpr::Filter {
        input: Box::new(SetExpr::TopCount {
            input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
            count: 3,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
        predicate: Predicate::Matches {
            hierarchy: fx.hierarchy("[Customers]"),
            pattern: "(?i)^jeanne ".to_string(),
        },
    });

    let err = run.evaluate(&fx, &fx.ctx(&config), &axis).unwrap_err();
    assert!(matches!(
        err,
        NativeError::UnsupportedNativeEvaluation { function, .. } if function == "Filter"
    ));
}

#[test]
fn test_result_cap_applies_to_the_memory_path_too() {
    let fx = Fixture::new();
    let config = NativeConfig {
        result_limit: 3,
        ..NativeConfig::default()
    };
    let run = Run::new();
    // Plain products evaluate in memory; the cap still holds.
    let axis = AxisExpr::new(SetExpr::crossjoin(
        SetExpr::LevelMembers(fx.level("[Time].[Quarter]")),
        SetExpr::LevelMembers(fx.level("[Product].[Family]")),
    ));

    let err = run.evaluate(&fx, &fx.ctx(&config), &axis).unwrap_err();
    assert!(matches!(
        err,
        NativeError::ResultSizeExceeded {
            attempted: 6,
            cap: 3,
        }
    ));
}

#[test]
fn test_known_oversize_aborts_before_sql() {
    let fx = Fixture::new();
    let config = NativeConfig {
        result_limit: 5,
        ..NativeConfig::default()
    };
    let run = Run::new();
    // A plain level read's size is the arena count; no statement runs.
    let axis = AxisExpr::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]")));

    let err = run.evaluate(&fx, &fx.ctx(&config), &axis).unwrap_err();
    assert!(matches!(
        err,
        NativeError::ResultSizeExceeded {
            attempted: 18,
            cap: 5,
        }
    ));
    assert!(run.sink.executed_sql().is_empty());
    assert!(run.cache.is_empty());
}

// ===== Statement shapes =====

#[test]
fn test_aggregate_substitutes_for_covered_reads() {
    let fx = Fixture::new();
    let config = NativeConfig {
        use_aggregates: true,
        read_aggregates: true,
        ..NativeConfig::default()
    };
    let run = Run::new();
    let ctx = fx.ctx(&config).with_measure(measure(UNIT_SALES));

    let list = run
        .evaluate(
            &fx,
            &ctx,
            &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
        )
        .unwrap();

    let sql = run.sink.executed_sql();
    assert_eq!(sql.len(), 1);
    assert!(sql[0].contains("agg_ts_sales"), "{}", sql[0]);
    assert!(!sql[0].contains("sales_fact"), "{}", sql[0]);
    assert_eq!(
        keys(&list),
        vec![
            vec!["[Time].[1997].[Q1]".to_string()],
            vec!["[Time].[1997].[Q2]".to_string()],
            vec!["[Time].[1998].[Q1]".to_string()],
        ]
    );
}

#[test]
fn test_virtual_cube_read_unions_base_cubes() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();
    let ctx = fx
        .ctx_for(&config, "Sales and Warehouse")
        .with_measure(measure(UNIT_SALES))
        .with_measure(measure(WAREHOUSE_SALES));

    let list = run
        .evaluate(
            &fx,
            &ctx,
            &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Product].[Name]"))),
        )
        .unwrap();

    let sql = run.sink.executed_sql();
    assert_eq!(sql.len(), 1);
    assert!(sql[0].contains("UNION"), "{}", sql[0]);
    // Muffins never sold and never shipped; everything else did one or
    // the other.
    assert_eq!(
        leaves(&list),
        vec![
            "Amber Ale",
            "Merlot",
            "Berry Juice",
            "Cola",
            "Bagels",
            "Mystery Snack",
        ]
    );
}

#[test]
fn test_ranking_measure_drives_the_cut() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();

    let list = run
        .evaluate(
            &fx,
            &fx.ctx(&config),
            &AxisExpr::new(SetExpr::TopCount {
                input: Box::new(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
                count: 3,
                order_by: Some(NumericExpr::Measure(measure(STORE_SALES))),
            }),
        )
        .unwrap();

    assert_eq!(run.sink.executed_sql().len(), 1);
    assert_eq!(
        leaves(&list),
        vec!["Gail Pirnie", "Jeannette Bura", "Jeanne Ellis"]
    );
}

#[test]
fn test_compound_slicer_scopes_native_reads() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();
    let ctx = fx
        .ctx(&config)
        .with_slicer([fx.member("[Time].[H1 1997]")])
        .with_measure(measure(UNIT_SALES));

    let list = run
        .evaluate(
            &fx,
            &ctx,
            &AxisExpr::non_empty(SetExpr::LevelMembers(fx.level("[Customers].[Customer]"))),
        )
        .unwrap();

    assert_eq!(run.sink.executed_sql().len(), 1);
    assert_eq!(
        leaves(&list),
        vec![
            "Derrick Whelply",
            "Gail Pirnie",
            "Karen Moreland",
            "Jeanne Bradley",
            "Jeanne Deri",
            "Jeanne Derry",
            "Jeanne Ellis",
            "Jeanne Fernandez",
            "Jeanne McDill",
            "Jeanne Turner",
            "Mary Price",
        ]
    );
}

// ===== Snowflake edges =====

#[test]
fn test_ragged_category_read_round_trips_null_keys() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();

    let list = run
        .evaluate(
            &fx,
            &fx.ctx(&config),
            &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Product].[Category]"))),
        )
        .unwrap();

    assert_eq!(run.sink.executed_sql().len(), 1);
    // Carbonated has no product rows; the NULL-keyed class comes back
    // as its stored member.
    assert_eq!(
        leaves(&list),
        vec!["Alcohol", "Beverages", "Baked Goods", "Unclassified"]
    );
}

#[test]
fn test_leaf_level_read_stays_native_without_childless_filter() {
    let fx = Fixture::new();
    let config = NativeConfig {
        filter_childless_snowflake_members: false,
        ..NativeConfig::default()
    };
    let run = Run::new();

    let list = run
        .evaluate(
            &fx,
            &fx.ctx(&config),
            &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Product].[Name]"))),
        )
        .unwrap();

    assert_eq!(run.sink.executed_sql().len(), 1);
    assert_eq!(list.len(), 7, "every product row exists at the leaf");
}

// ===== Failure paths =====

#[test]
fn test_unknown_key_surfaces_as_execution_error() {
    let mut builder = CatalogBuilder::new();
    let time = builder.add_hierarchy(
        HierarchySpec::new("Time", "time_by_day", "time_id")
            .level(LevelSpec::new("Year", "time_by_day", "the_year")),
    );
    builder.add_member(time, None, "1997", KeyValue::Int(1997));
    builder.add_cube(Cube {
        name: "Sales".to_string(),
        fact_table: "sales_fact".to_string(),
        dimensions: vec![DimensionUsage {
            hierarchy: time,
            fact_column: "time_id".to_string(),
        }],
        measures: vec![Measure {
            key: measure(UNIT_SALES),
            name: "Unit Sales".to_string(),
            expr: MeasureExpr::Column {
                column: "unit_sales".to_string(),
                agg: Aggregator::Sum,
            },
        }],
        aggregates: Vec::new(),
    });
    let catalog = builder.build();
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .execute_batch(
            "CREATE TABLE time_by_day (time_id INTEGER, the_year INTEGER);
             CREATE TABLE sales_fact (time_id INTEGER, unit_sales REAL);
             INSERT INTO time_by_day VALUES (1, 1997), (2, 1999);",
        )
        .unwrap();

    let config = NativeConfig::default();
    let ctx = EvalContext::new(&catalog, &config, catalog.cube_ref("Sales").unwrap());
    let cache = ResultCache::new();
    let sink = CollectingSink::new();
    let year = catalog
        .level_by_key(&opal::model::LevelKey("[Time].[Year]".to_string()))
        .unwrap()
        .id;

    let err = NativeEvaluator::new(&store, &store, &cache, &sink)
        .evaluate(&ctx, &AxisExpr::new(SetExpr::LevelMembers(year)))
        .unwrap_err();

    assert!(matches!(
        err,
        NativeError::SqlExecutionFailure(SqlExecutionError::UnknownKey { level, value })
            if level == "[Time].[Year]" && value == "1999"
    ));
    assert!(cache.is_empty(), "a failed read leaves no entry behind");
}

#[test]
fn test_cancelled_statement_stops_before_sql() {
    let fx = Fixture::new();
    let config = NativeConfig::default();
    let run = Run::new();
    // The statement holds the token and cancels from outside.
    let token = CancelToken::new();
    let ctx = fx.ctx(&config).with_cancel(token.clone());
    token.cancel();

    let err = run
        .evaluate(
            &fx,
            &ctx,
            &AxisExpr::new(SetExpr::LevelMembers(fx.level("[Time].[Quarter]"))),
        )
        .unwrap_err();

    assert!(matches!(err, NativeError::Cancelled));
    assert!(run.sink.executed_sql().is_empty());
    assert!(run.cache.is_empty());
}
