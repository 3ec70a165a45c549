//! Statement shapes out of the full lowering pipeline: axis expression
//! through analysis and constraint building down to dialect SQL. Every
//! generated statement is parse-checked for the dialect it was
//! serialized for.

use std::collections::BTreeMap;

use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use opal::config::NativeConfig;
use opal::constraint::{BuildOutcome, ConstraintBuilder};
use opal::expr::{AxisExpr, CompareOp, NumericExpr, Predicate, SetExpr};
use opal::model::{
    AggTable, Aggregator, Catalog, CatalogBuilder, Cube, DimensionUsage, EvalContext,
    HierarchyAccess, HierarchyId, HierarchyKey, HierarchySpec, KeyValue, LevelId, LevelKey,
    LevelSpec, Measure, MeasureExpr, MeasureKey, MemberId, MemberKey, Role, RollupPolicy,
    SnowflakeJoin, VirtualCube,
};
use opal::native::{Analysis, SetAnalyzer};
use opal::sql::{Dialect, GeneratedSql, SqlGenerator};

const UNIT_SALES: &str = "[Measures].[Unit Sales]";
const STORE_SALES: &str = "[Measures].[Store Sales]";
const WAREHOUSE_SALES: &str = "[Measures].[Warehouse Sales]";

fn measure(key: &str) -> MeasureKey {
    MeasureKey(key.to_string())
}

fn catalog() -> Catalog {
    let mut b = CatalogBuilder::new();

    let time = b.add_hierarchy(
        HierarchySpec::new("Time", "time_by_day", "time_id")
            .level(LevelSpec::new("Year", "time_by_day", "the_year"))
            .level(LevelSpec::new("Quarter", "time_by_day", "quarter")),
    );
    let y1997 = b.add_member(time, None, "1997", KeyValue::Int(1997));
    b.add_member(time, Some(y1997), "Q1", KeyValue::Str("Q1".to_string()));
    b.add_member(time, Some(y1997), "Q2", KeyValue::Str("Q2".to_string()));
    let y1998 = b.add_member(time, None, "1998", KeyValue::Int(1998));
    b.add_member(time, Some(y1998), "Q1", KeyValue::Str("Q1".to_string()));

    let customers = b.add_hierarchy(
        HierarchySpec::new("Customers", "customer", "customer_id")
            .level(LevelSpec::new("Country", "customer", "country"))
            .level(LevelSpec::new("Customer", "customer", "customer_id").captioned_by("fullname")),
    );
    let usa = b.add_member(customers, None, "USA", KeyValue::Str("USA".to_string()));
    b.add_member(customers, Some(usa), "Jeanne Smith", KeyValue::Int(1));
    b.add_member(customers, Some(usa), "Pat Doe", KeyValue::Int(2));
    let canada = b.add_member(customers, None, "Canada", KeyValue::Str("Canada".to_string()));
    b.add_member(customers, Some(canada), "Sam Roe", KeyValue::Int(3));

    let product = b.add_hierarchy(
        HierarchySpec::new("Product", "product", "product_id")
            .level(LevelSpec::new("Family", "product_class", "product_family"))
            .level(LevelSpec::new("Category", "product_class", "product_category").nullable())
            .level(LevelSpec::new("Name", "product", "product_name"))
            .join(SnowflakeJoin {
                left_table: "product".to_string(),
                left_column: "product_class_id".to_string(),
                right_table: "product_class".to_string(),
                right_column: "product_class_id".to_string(),
            }),
    );
    let drink = b.add_member(product, None, "Drink", KeyValue::Str("Drink".to_string()));
    let soda = b.add_member(product, Some(drink), "Soda", KeyValue::Str("Soda".to_string()));
    b.add_member(product, Some(soda), "Cola", KeyValue::Str("Cola".to_string()));
    let food = b.add_member(product, None, "Food", KeyValue::Str("Food".to_string()));
    let baked = b.add_member(product, Some(food), "Baked", KeyValue::Str("Baked".to_string()));
    b.add_member(product, Some(baked), "Bread", KeyValue::Str("Bread".to_string()));
    let unclassified = b.add_member(product, Some(food), "Unclassified", KeyValue::Null);
    b.add_member(
        product,
        Some(unclassified),
        "Snack",
        KeyValue::Str("Snack".to_string()),
    );

    b.add_cube(Cube {
        name: "Sales".to_string(),
        fact_table: "sales_fact".to_string(),
        dimensions: vec![
            DimensionUsage {
                hierarchy: time,
                fact_column: "time_id".to_string(),
            },
            DimensionUsage {
                hierarchy: customers,
                fact_column: "customer_id".to_string(),
            },
            DimensionUsage {
                hierarchy: product,
                fact_column: "product_id".to_string(),
            },
        ],
        measures: vec![
            Measure {
                key: measure(UNIT_SALES),
                name: "Unit Sales".to_string(),
                expr: MeasureExpr::Column {
                    column: "unit_sales".to_string(),
                    agg: Aggregator::Sum,
                },
            },
            Measure {
                key: measure(STORE_SALES),
                name: "Store Sales".to_string(),
                expr: MeasureExpr::Column {
                    column: "store_sales".to_string(),
                    agg: Aggregator::Sum,
                },
            },
        ],
        aggregates: vec![AggTable {
            name: "agg_year_sales".to_string(),
            level_columns: BTreeMap::from([(
                LevelKey("[Time].[Year]".to_string()),
                "the_year".to_string(),
            )]),
            measure_columns: BTreeMap::from([(measure(UNIT_SALES), "unit_sales_sum".to_string())]),
            row_count: 42,
        }],
    });

    b.add_cube(Cube {
        name: "Warehouse".to_string(),
        fact_table: "inventory_fact".to_string(),
        dimensions: vec![
            DimensionUsage {
                hierarchy: time,
                fact_column: "time_id".to_string(),
            },
            DimensionUsage {
                hierarchy: product,
                fact_column: "product_id".to_string(),
            },
        ],
        measures: vec![Measure {
            key: measure(WAREHOUSE_SALES),
            name: "Warehouse Sales".to_string(),
            expr: MeasureExpr::Column {
                column: "warehouse_sales".to_string(),
                agg: Aggregator::Sum,
            },
        }],
        aggregates: Vec::new(),
    });

    b.add_virtual_cube(VirtualCube {
        name: "Sales and Warehouse".to_string(),
        base_cubes: vec!["Sales".to_string(), "Warehouse".to_string()],
        measure_cube: BTreeMap::from([
            (measure(UNIT_SALES), "Sales".to_string()),
            (measure(STORE_SALES), "Sales".to_string()),
            (measure(WAREHOUSE_SALES), "Warehouse".to_string()),
        ]),
    });

    b.build()
}

fn ctx<'a>(catalog: &'a Catalog, config: &'a NativeConfig, cube: &str) -> EvalContext<'a> {
    EvalContext::new(catalog, config, catalog.cube_ref(cube).unwrap())
}

fn member(catalog: &Catalog, key: &str) -> MemberId {
    catalog
        .member_by_key(&MemberKey(key.to_string()))
        .unwrap_or_else(|| panic!("no member {}", key))
        .id
}

fn level(catalog: &Catalog, key: &str) -> LevelId {
    catalog
        .level_by_key(&LevelKey(key.to_string()))
        .unwrap_or_else(|| panic!("no level {}", key))
        .id
}

fn hierarchy(catalog: &Catalog, key: &str) -> HierarchyId {
    catalog
        .hierarchy_by_key(&HierarchyKey(key.to_string()))
        .unwrap_or_else(|| panic!("no hierarchy {}", key))
        .id
}

/// Analyze, build and lower one axis; panics anywhere off the native
/// path.
fn lower(ctx: &EvalContext<'_>, axis: &AxisExpr, dialect: Dialect) -> GeneratedSql {
    let plan = match SetAnalyzer::new(ctx).analyze(axis) {
        Analysis::Native(plan) => plan,
        other => panic!("expected a native plan, got {:?}", other),
    };
    let request = match ConstraintBuilder::new(ctx).build(&plan) {
        BuildOutcome::Request(request) => request,
        other => panic!("expected a request, got {:?}", other),
    };
    let generated = SqlGenerator::new(ctx.catalog, ctx.config, dialect)
        .generate(&request.target, &request.constraint)
        .unwrap();
    parses(&generated.sql, dialect);
    generated
}

/// Panics unless the statement parses under the dialect's grammar.
fn parses(sql: &str, dialect: Dialect) {
    let grammar: Box<dyn sqlparser::dialect::Dialect> = match dialect {
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
    };
    if let Err(e) = Parser::parse_sql(&*grammar, sql) {
        panic!("invalid SQL for {:?}: {}\nSQL: {}", dialect, e, sql);
    }
}

// ===== Member selects =====

#[test]
fn test_level_read_selects_distinct_key_chain() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(level(&catalog, "[Time].[Quarter]"))),
        Dialect::Sqlite,
    );

    assert!(generated.sql.starts_with("SELECT DISTINCT"), "{}", generated.sql);
    assert!(
        generated.sql.contains("\"time_by_day\".\"the_year\" AS \"c0\""),
        "{}",
        generated.sql
    );
    assert!(
        generated.sql.contains("\"time_by_day\".\"quarter\" AS \"c1\""),
        "{}",
        generated.sql
    );
    assert!(!generated.sql.contains("JOIN"), "{}", generated.sql);
    assert_eq!(generated.shape.width(), 2);
}

#[test]
fn test_snowflake_read_joins_the_class_table() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(level(&catalog, "[Product].[Name]"))),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("FROM \"product\""), "{}", generated.sql);
    assert!(
        generated.sql.contains(
            "INNER JOIN \"product_class\" ON \"product\".\"product_class_id\" = \
             \"product_class\".\"product_class_id\""
        ),
        "{}",
        generated.sql
    );
    assert!(
        generated.sql.contains("\"product\".\"product_name\" AS \"c2\""),
        "{}",
        generated.sql
    );
    assert_eq!(generated.shape.width(), 3);
}

#[test]
fn test_children_read_pins_the_parent_path() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::Children(member(&catalog, "[Time].[1997]"))),
        Dialect::Sqlite,
    );

    assert!(
        generated.sql.contains("WHERE \"time_by_day\".\"the_year\" = 1997"),
        "{}",
        generated.sql
    );
    assert_eq!(generated.shape.width(), 2);
}

#[test]
fn test_member_list_renders_grouped_branches() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    // 1998's only quarter collapses to its year; 1997's does not.
    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::Members(vec![
            member(&catalog, "[Time].[1997].[Q1]"),
            member(&catalog, "[Time].[1998].[Q1]"),
        ])),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains(" OR "), "{}", generated.sql);
    assert!(
        generated.sql.contains("\"time_by_day\".\"quarter\" = 'Q1'"),
        "{}",
        generated.sql
    );
    assert!(
        generated.sql.contains("\"time_by_day\".\"the_year\" = 1998"),
        "{}",
        generated.sql
    );
}

#[test]
fn test_null_keyed_member_renders_is_null() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::Members(vec![member(
            &catalog,
            "[Product].[Food].[Unclassified]",
        )])),
        Dialect::Sqlite,
    );

    assert!(
        generated.sql.contains("\"product_class\".\"product_family\" = 'Food'"),
        "{}",
        generated.sql
    );
    assert!(
        generated
            .sql
            .contains("\"product_class\".\"product_category\" IS NULL"),
        "{}",
        generated.sql
    );
}

#[test]
fn test_role_groups_scope_member_reads() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let mut role = Role::new("usa");
    role.grant(
        HierarchyKey("[Customers]".to_string()),
        HierarchyAccess::Custom {
            allowed: vec![member(&catalog, "[Customers].[USA]")],
            rollup: RollupPolicy::Partial,
        },
    );
    let ctx = ctx(&catalog, &config, "Sales").with_role(&role);

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::LevelMembers(level(
            &catalog,
            "[Customers].[Customer]",
        ))),
        Dialect::Sqlite,
    );

    assert!(
        generated.sql.contains("\"customer\".\"country\" = 'USA'"),
        "{}",
        generated.sql
    );
}

// ===== Regex matches per dialect =====

#[test]
fn test_caption_match_renders_per_dialect() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");
    let axis = AxisExpr::new(SetExpr::Filter {
        input: Box::new(SetExpr::LevelMembers(level(
            &catalog,
            "[Customers].[Customer]",
        ))),
        predicate: Predicate::Matches {
            hierarchy: hierarchy(&catalog, "[Customers]"),
            pattern: "(?i)^jeanne ".to_string(),
        },
    });

    let sqlite = lower(&ctx, &axis, Dialect::Sqlite);
    assert!(
        sqlite
            .sql
            .contains("regexp('(?i)^jeanne ', \"customer\".\"fullname\")"),
        "{}",
        sqlite.sql
    );

    let postgres = lower(&ctx, &axis, Dialect::Postgres);
    assert!(
        postgres
            .sql
            .contains("\"customer\".\"fullname\" ~ '(?i)^jeanne '"),
        "{}",
        postgres.sql
    );

    let mysql = lower(&ctx, &axis, Dialect::MySql);
    assert!(
        mysql
            .sql
            .contains("regexp_like(`customer`.`fullname`, '(?i)^jeanne ')"),
        "{}",
        mysql.sql
    );
}

// ===== Fact-backed selects =====

#[test]
fn test_non_empty_read_joins_fact_and_probes() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales").with_measure(measure(UNIT_SALES));

    let generated = lower(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(level(
            &catalog,
            "[Customers].[Customer]",
        ))),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("FROM \"sales_fact\""), "{}", generated.sql);
    assert!(generated.sql.contains("INNER JOIN \"customer\""), "{}", generated.sql);
    assert!(generated.sql.contains("GROUP BY"), "{}", generated.sql);
    assert!(
        generated.sql.contains("\"sales_fact\".\"unit_sales\" IS NOT NULL"),
        "{}",
        generated.sql
    );
}

#[test]
fn test_context_member_filters_the_joined_dimension() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales")
        .with_slicer([member(&catalog, "[Time].[1997].[Q1]")])
        .with_measure(measure(UNIT_SALES));

    let generated = lower(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(level(
            &catalog,
            "[Customers].[Customer]",
        ))),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("INNER JOIN \"time_by_day\""), "{}", generated.sql);
    assert!(
        generated.sql.contains("\"time_by_day\".\"the_year\" = 1997"),
        "{}",
        generated.sql
    );
    assert!(
        generated.sql.contains("\"time_by_day\".\"quarter\" = 'Q1'"),
        "{}",
        generated.sql
    );
}

#[test]
fn test_measure_filter_renders_having() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales").with_measure(measure(UNIT_SALES));

    let generated = lower(
        &ctx,
        &AxisExpr::non_empty(SetExpr::Filter {
            input: Box::new(SetExpr::LevelMembers(level(
                &catalog,
                "[Customers].[Customer]",
            ))),
            predicate: Predicate::Compare {
                left: NumericExpr::Measure(measure(UNIT_SALES)),
                op: CompareOp::Gt,
                right: NumericExpr::Literal(4.5),
            },
        }),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("HAVING"), "{}", generated.sql);
    assert!(
        generated.sql.contains("SUM(\"sales_fact\".\"unit_sales\") > 4.5"),
        "{}",
        generated.sql
    );
}

#[test]
fn test_ranked_read_limits_and_ranks_nulls_last() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales");

    let generated = lower(
        &ctx,
        &AxisExpr::new(SetExpr::TopCount {
            input: Box::new(SetExpr::LevelMembers(level(
                &catalog,
                "[Customers].[Customer]",
            ))),
            count: 2,
            order_by: Some(NumericExpr::Measure(measure(UNIT_SALES))),
        }),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("LEFT JOIN"), "{}", generated.sql);
    assert!(generated.sql.contains("ORDER BY"), "{}", generated.sql);
    // Null ranks sort by the portable boolean key, not NULLS LAST.
    assert!(generated.sql.contains("IS NULL)"), "{}", generated.sql);
    assert!(generated.sql.contains(" DESC"), "{}", generated.sql);
    assert!(generated.sql.contains("LIMIT 2"), "{}", generated.sql);
}

// ===== Aggregates and virtual cubes =====

#[test]
fn test_aggregate_substitution_swaps_tables() {
    let catalog = catalog();
    let config = NativeConfig {
        use_aggregates: true,
        read_aggregates: true,
        ..NativeConfig::default()
    };

    let covered = lower(
        &ctx(&catalog, &config, "Sales").with_measure(measure(UNIT_SALES)),
        &AxisExpr::non_empty(SetExpr::LevelMembers(level(&catalog, "[Time].[Year]"))),
        Dialect::Sqlite,
    );
    assert!(covered.sql.contains("FROM \"agg_year_sales\""), "{}", covered.sql);
    assert!(
        covered.sql.contains("\"agg_year_sales\".\"unit_sales_sum\" IS NOT NULL"),
        "{}",
        covered.sql
    );
    assert!(!covered.sql.contains("sales_fact"), "{}", covered.sql);

    // Quarter grain is not in the rollup table; the read stays on the
    // fact.
    let uncovered = lower(
        &ctx(&catalog, &config, "Sales").with_measure(measure(UNIT_SALES)),
        &AxisExpr::non_empty(SetExpr::LevelMembers(level(&catalog, "[Time].[Quarter]"))),
        Dialect::Sqlite,
    );
    assert!(uncovered.sql.contains("FROM \"sales_fact\""), "{}", uncovered.sql);
}

#[test]
fn test_virtual_read_unions_bases_with_one_outer_order() {
    let catalog = catalog();
    let config = NativeConfig::default();
    let ctx = ctx(&catalog, &config, "Sales and Warehouse")
        .with_measure(measure(UNIT_SALES))
        .with_measure(measure(WAREHOUSE_SALES));

    let generated = lower(
        &ctx,
        &AxisExpr::non_empty(SetExpr::LevelMembers(level(&catalog, "[Product].[Name]"))),
        Dialect::Sqlite,
    );

    assert!(generated.sql.contains("UNION"), "{}", generated.sql);
    assert!(generated.sql.contains("\"sales_fact\""), "{}", generated.sql);
    assert!(generated.sql.contains("\"inventory_fact\""), "{}", generated.sql);
    assert_eq!(
        generated.sql.matches("ORDER BY").count(),
        1,
        "one outer sort over the union: {}",
        generated.sql
    );
}
