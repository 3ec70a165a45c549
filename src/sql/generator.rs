//! Lowers a `(target, constraint)` pair into one SELECT per base cube.
//!
//! Three statement shapes cover every native read:
//!
//! - a DISTINCT select over dimension tables alone, when nothing
//!   involves the fact table;
//! - an INNER-joined fact select with GROUP BY, for non-empty reads;
//! - a dimension select LEFT-joined to a derived fact subquery, for
//!   measure-ranked reads where empty members must keep their rows.
//!
//! Reads against a virtual cube fan out to one select per base cube,
//! combined by UNION. When aggregate substitution is enabled and a
//! pre-aggregated table covers every level and measure a non-empty
//! read touches, the smallest covering table replaces the fact join.
//!
//! Unbounded statements carry no ORDER BY; the evaluator reorders
//! every result canonically anyway, and bounded reads are the only
//! ones where SQL-side order changes which rows come back.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::NativeConfig;
use crate::constraint::{
    CacheTarget, HavingFilter, MemberGroup, SqlConstraint, TargetSlot,
};
use crate::model::catalog::Catalog;
use crate::model::cube::{AggTable, Aggregator, Cube, MeasureExpr, MeasureKey};
use crate::model::hierarchy::{
    Hierarchy, HierarchyId, HierarchyKey, Level, LevelId, LevelKey, SnowflakeJoin,
};
use crate::model::member::{KeyValue, Member, MemberKey};

use super::dialect::Dialect;
use super::select::{
    and_all, lit_float, lit_int, lit_str, or_all, tcol, OrderItem, SelectColumn,
    SelectQuery, SqlExpr, SqlStatement, TableRef, TableSource, UnionQuery,
};
use super::SqlExecutionError;

// =============================================================================
// Row shape
// =============================================================================

/// Column layout of one tuple position: the root-to-slot level chain.
/// One key column per chain level identifies the member, ancestor
/// columns first, so ragged NULL keys stay unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotShape {
    pub hierarchy: HierarchyId,
    pub levels: Vec<LevelId>,
}

/// Column layout of a generated statement's rows, slot per slot in
/// target order. Key columns occupy positions `0..width()`; anything
/// after them exists only to satisfy SELECT DISTINCT ordering rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowShape {
    pub slots: Vec<SlotShape>,
}

impl RowShape {
    /// Resolve the level chain of every target slot.
    pub fn for_target(
        catalog: &Catalog,
        target: &CacheTarget,
    ) -> Result<Self, SqlExecutionError> {
        let mut slots = Vec::with_capacity(target.arity());
        for slot in target.slots() {
            let (hierarchy, depth) = match slot {
                TargetSlot::Level(key) => {
                    let level = lookup_level(catalog, key)?;
                    (level.hierarchy, level.depth)
                }
                TargetSlot::Children(parent) => {
                    let member = lookup_member(catalog, parent)?;
                    let hierarchy = catalog.hierarchy(member.hierarchy);
                    if hierarchy.level_at_depth(member.depth + 1).is_none() {
                        return Err(SqlExecutionError::Lowering(format!(
                            "{} has no child level",
                            parent
                        )));
                    }
                    (member.hierarchy, member.depth + 1)
                }
                TargetSlot::Descendants { ancestor, level } => {
                    let member = lookup_member(catalog, ancestor)?;
                    let target_level = lookup_level(catalog, level)?;
                    if target_level.hierarchy != member.hierarchy
                        || target_level.depth <= member.depth
                    {
                        return Err(SqlExecutionError::Lowering(format!(
                            "{} is not below {}",
                            level, ancestor
                        )));
                    }
                    (member.hierarchy, target_level.depth)
                }
            };
            let levels = catalog.hierarchy(hierarchy).levels[..depth].to_vec();
            slots.push(SlotShape { hierarchy, levels });
        }
        Ok(RowShape { slots })
    }

    /// Number of key columns per row.
    pub fn width(&self) -> usize {
        self.slots.iter().map(|slot| slot.levels.len()).sum()
    }
}

/// A lowered statement plus the layout needed to read its rows back.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub shape: RowShape,
}

// =============================================================================
// Generator
// =============================================================================

/// How a level's key column is rendered. Fact-backed selects read it
/// off the dimension table, aggregate-backed selects off the rollup
/// table's flattened columns.
type ColumnFn<'f> = &'f dyn Fn(&Level) -> Result<SqlExpr, SqlExecutionError>;

/// How a measure reference inside HAVING or ORDER BY is rendered.
type MeasureFn<'f> = &'f dyn Fn(&MeasureKey) -> Result<SqlExpr, SqlExecutionError>;

pub struct SqlGenerator<'a> {
    catalog: &'a Catalog,
    config: &'a NativeConfig,
    dialect: Dialect,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(catalog: &'a Catalog, config: &'a NativeConfig, dialect: Dialect) -> Self {
        Self {
            catalog,
            config,
            dialect,
        }
    }

    /// Lower one native read. The same inputs always produce the same
    /// statement text; the cache key depends on it.
    pub fn generate(
        &self,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<GeneratedSql, SqlExecutionError> {
        let cube = self.catalog.cube_ref(&constraint.cube).ok_or_else(|| {
            SqlExecutionError::Lowering(format!("unknown cube {}", constraint.cube))
        })?;
        let bases = self.catalog.base_cubes_for(cube, &constraint.measures);
        if bases.is_empty() {
            return Err(SqlExecutionError::Lowering(format!(
                "no base cube of {} carries the requested measures",
                constraint.cube
            )));
        }
        let shape = RowShape::for_target(self.catalog, target)?;

        let statement = if !constraint.needs_fact() {
            SqlStatement::Select(self.member_select(&shape, target, constraint)?)
        } else if let [base] = bases.as_slice() {
            SqlStatement::Select(self.fact_select(base, &shape, target, constraint)?)
        } else {
            // Branches may not carry ORDER BY or LIMIT of their own,
            // and a shared bound would change per-branch membership.
            if constraint.bound.is_some() {
                return Err(SqlExecutionError::Lowering(
                    "a row bound does not combine with a multi-cube union".to_string(),
                ));
            }
            let branches = bases
                .iter()
                .map(|base| self.fact_select(base, &shape, target, constraint))
                .collect::<Result<Vec<_>, _>>()?;
            let order_by = (0..shape.width()).map(|i| format!("c{}", i)).collect();
            SqlStatement::Union(UnionQuery { branches, order_by })
        };

        Ok(GeneratedSql {
            sql: statement.to_sql(self.dialect),
            shape,
        })
    }

    // =========================================================================
    // Dimension-only reads
    // =========================================================================

    /// SELECT DISTINCT over the target hierarchy's own tables.
    fn member_select(
        &self,
        shape: &RowShape,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<SelectQuery, SqlExecutionError> {
        let slot = match shape.slots.as_slice() {
            [slot] => slot,
            _ => {
                return Err(SqlExecutionError::Lowering(
                    "a multi-hierarchy read needs the fact table".to_string(),
                ))
            }
        };
        let hierarchy = self.catalog.hierarchy(slot.hierarchy);
        let needed = self.needed_tables(shape, constraint)?;
        let empty = BTreeSet::new();
        let tables = needed.get(&slot.hierarchy).unwrap_or(&empty);

        let mut query = SelectQuery::new(TableRef::new(&hierarchy.primary_table)).distinct();
        for hop in snowflake_hops(hierarchy, tables) {
            query = query.inner_join(
                TableRef::new(&hop.right_table),
                tcol(&hop.left_table, &hop.left_column)
                    .eq(tcol(&hop.right_table, &hop.right_column)),
            );
        }
        query = self.select_keys(query, shape, &dim_column)?;
        query = self.filter_members(query, target, constraint, &dim_column)?;

        if let Some(having) = &constraint.having {
            // No GROUP BY here, so caption matches render in WHERE.
            let no_measure = |key: &MeasureKey| -> Result<SqlExpr, SqlExecutionError> {
                Err(SqlExecutionError::Lowering(format!(
                    "measure {} in a dimension-only read",
                    key
                )))
            };
            query = query.filter(self.having_expr(having, &no_measure)?);
        }

        if let Some(bound) = &constraint.bound {
            query = self.select_order_columns(query, shape);
            query = query
                .order_by(self.canonical_order(shape, &dim_column)?)
                .limit(bound.limit);
        }
        Ok(query)
    }

    /// WHERE terms shared by every statement shape: slot ancestor
    /// paths, member restrictions and role grants on the target
    /// hierarchy or, for fact selects, on every joined hierarchy.
    fn filter_members(
        &self,
        mut query: SelectQuery,
        target: &CacheTarget,
        constraint: &SqlConstraint,
        col: ColumnFn<'_>,
    ) -> Result<SelectQuery, SqlExecutionError> {
        for slot in target.slots() {
            if let Some(filter) = self.slot_filter(slot, col)? {
                query = query.filter(filter);
            }
        }
        for restriction in &constraint.restrictions {
            query = query.filter(self.groups_expr(&restriction.groups, col)?);
        }
        for filter in &constraint.role {
            query = query.filter(self.groups_expr(&filter.groups, col)?);
        }
        Ok(query)
    }

    // =========================================================================
    // Fact-backed reads
    // =========================================================================

    fn fact_select(
        &self,
        base: &Cube,
        shape: &RowShape,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<SelectQuery, SqlExecutionError> {
        if constraint.non_empty {
            if let Some(agg) = self.covering_aggregate(base, shape, constraint)? {
                return self.aggregate_select(base, agg, shape, target, constraint);
            }
            self.inner_fact_select(base, shape, target, constraint)
        } else {
            self.ranked_select(base, shape, target, constraint)
        }
    }

    /// Non-empty read: fact table inner-joined to every hierarchy the
    /// statement touches, grouped by the key chain.
    fn inner_fact_select(
        &self,
        base: &Cube,
        shape: &RowShape,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<SelectQuery, SqlExecutionError> {
        let fact = base.fact_table.as_str();
        let needed = self.needed_tables(shape, constraint)?;
        let targets: BTreeSet<HierarchyId> =
            shape.slots.iter().map(|slot| slot.hierarchy).collect();

        let mut query = SelectQuery::new(TableRef::new(fact));
        let mut joined: BTreeSet<HierarchyId> = BTreeSet::new();
        for (hierarchy_id, tables) in &needed {
            let hierarchy = self.catalog.hierarchy(*hierarchy_id);
            let usage = match base.usage(*hierarchy_id) {
                Some(usage) => usage,
                None if targets.contains(hierarchy_id) => {
                    return Err(SqlExecutionError::Lowering(format!(
                        "hierarchy {} is not joined to cube {}",
                        hierarchy.key, base.name
                    )))
                }
                // A restriction on a hierarchy this cube does not use
                // leaves its rows unscoped, matching cell semantics.
                None => continue,
            };
            query = self.join_dimension(query, fact, &usage.fact_column, hierarchy, tables);
            joined.insert(*hierarchy_id);
        }

        query = self.select_keys(query, shape, &dim_column)?;

        for slot in target.slots() {
            if let Some(filter) = self.slot_filter(slot, &dim_column)? {
                query = query.filter(filter);
            }
        }
        for restriction in &constraint.restrictions {
            let hierarchy = self.hierarchy(&restriction.hierarchy)?;
            if !joined.contains(&hierarchy.id) {
                continue;
            }
            query = query.filter(self.groups_expr(&restriction.groups, &dim_column)?);
        }
        for filter in &constraint.role {
            let hierarchy = self.hierarchy(&filter.hierarchy)?;
            if !joined.contains(&hierarchy.id) {
                continue;
            }
            query = query.filter(self.groups_expr(&filter.groups, &dim_column)?);
        }
        if let Some(probe) = non_empty_probe(base, fact, &constraint.measures) {
            query = query.filter(probe);
        }

        query = query.group_by(self.group_columns(shape, constraint, &dim_column)?);

        if let Some(having) = &constraint.having {
            let measure =
                |key: &MeasureKey| self.measure_aggregate(base, fact, key);
            query = query.having(self.having_expr(having, &measure)?);
        }

        if let Some(bound) = &constraint.bound {
            let mut items = Vec::new();
            if let Some(order) = &bound.order {
                let expr = self.measure_aggregate(base, fact, &order.measure)?;
                let item = if order.desc {
                    OrderItem::desc(expr)
                } else {
                    OrderItem::asc(expr)
                };
                items.push(item.nulls_last());
            }
            items.extend(self.canonical_order(shape, &dim_column)?);
            query = query.order_by(items).limit(bound.limit);
        }
        Ok(query)
    }

    /// Measure-ranked read. Members that match no fact row must keep
    /// their tuple and rank by NULL, so the fact side becomes a derived
    /// table LEFT-joined to the dimension rows.
    fn ranked_select(
        &self,
        base: &Cube,
        shape: &RowShape,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<SelectQuery, SqlExecutionError> {
        let slot = match shape.slots.as_slice() {
            [slot] => slot,
            _ => {
                return Err(SqlExecutionError::Lowering(
                    "a measure-ranked read is single-hierarchy".to_string(),
                ))
            }
        };
        let hierarchy = self.catalog.hierarchy(slot.hierarchy);
        let usage = base.usage(slot.hierarchy).ok_or_else(|| {
            SqlExecutionError::Lowering(format!(
                "hierarchy {} is not joined to cube {}",
                hierarchy.key, base.name
            ))
        })?;
        let fact = base.fact_table.as_str();
        let needed = self.needed_tables(shape, constraint)?;

        let order = constraint.bound.as_ref().and_then(|b| b.order.as_ref());
        let ranked = match order {
            Some(order) => {
                let measure = base.measure(&order.measure).ok_or_else(|| {
                    SqlExecutionError::Lowering(format!(
                        "measure {} is not in cube {}",
                        order.measure, base.name
                    ))
                })?;
                Some((order, measure))
            }
            None => None,
        };

        // Fact side: raw fact rows scoped by context hierarchies, one
        // column per fact column the ranking measure reads plus the
        // join key back to the target dimension.
        let mut inner = SelectQuery::new(TableRef::new(fact))
            .column(SelectColumn::new(tcol(fact, &usage.fact_column)));
        let mut fact_columns = Vec::new();
        if let Some((_, measure)) = &ranked {
            collect_fact_columns(&measure.expr, &mut fact_columns);
        }
        for column in &fact_columns {
            if column != &usage.fact_column {
                inner = inner.column(SelectColumn::new(tcol(fact, column)));
            }
        }

        let mut joined: BTreeSet<HierarchyId> = BTreeSet::new();
        for (hierarchy_id, tables) in &needed {
            if *hierarchy_id == slot.hierarchy {
                continue;
            }
            let context = self.catalog.hierarchy(*hierarchy_id);
            let Some(context_usage) = base.usage(*hierarchy_id) else {
                continue;
            };
            inner = self.join_dimension(
                inner,
                fact,
                &context_usage.fact_column,
                context,
                tables,
            );
            joined.insert(*hierarchy_id);
        }
        for restriction in &constraint.restrictions {
            let restricted = self.hierarchy(&restriction.hierarchy)?;
            if restricted.id != slot.hierarchy && joined.contains(&restricted.id) {
                inner = inner.filter(self.groups_expr(&restriction.groups, &dim_column)?);
            }
        }
        for filter in &constraint.role {
            let granted = self.hierarchy(&filter.hierarchy)?;
            if !filter.on_target && joined.contains(&granted.id) {
                inner = inner.filter(self.groups_expr(&filter.groups, &dim_column)?);
            }
        }

        // Member side.
        let empty = BTreeSet::new();
        let tables = needed.get(&slot.hierarchy).unwrap_or(&empty);
        let mut query = SelectQuery::new(TableRef::new(&hierarchy.primary_table));
        for hop in snowflake_hops(hierarchy, tables) {
            query = query.inner_join(
                TableRef::new(&hop.right_table),
                tcol(&hop.left_table, &hop.left_column)
                    .eq(tcol(&hop.right_table, &hop.right_column)),
            );
        }
        query = query.left_join(
            TableSource::Derived {
                query: Box::new(inner),
                alias: "f".to_string(),
            },
            tcol("f", &usage.fact_column)
                .eq(tcol(&hierarchy.primary_table, &hierarchy.primary_key)),
        );

        query = self.select_keys(query, shape, &dim_column)?;

        for slot_target in target.slots() {
            if let Some(filter) = self.slot_filter(slot_target, &dim_column)? {
                query = query.filter(filter);
            }
        }
        for restriction in &constraint.restrictions {
            let restricted = self.hierarchy(&restriction.hierarchy)?;
            if restricted.id == slot.hierarchy {
                query = query.filter(self.groups_expr(&restriction.groups, &dim_column)?);
            }
        }
        for filter in &constraint.role {
            if filter.on_target {
                query = query.filter(self.groups_expr(&filter.groups, &dim_column)?);
            }
        }
        if let Some(having) = &constraint.having {
            // Only caption matches reach here; measure filters force a
            // non-empty context upstream. WHERE keeps them off the
            // grouped side.
            let no_measure = |key: &MeasureKey| -> Result<SqlExpr, SqlExecutionError> {
                Err(SqlExecutionError::Lowering(format!(
                    "measure {} in a ranked read's member filter",
                    key
                )))
            };
            query = query.filter(self.having_expr(having, &no_measure)?);
        }

        query = query.group_by(self.group_columns(shape, constraint, &dim_column)?);

        if let Some(bound) = &constraint.bound {
            let mut items = Vec::new();
            if let Some((order, measure)) = &ranked {
                let expr = measure_over("f", &measure.expr);
                let item = if order.desc {
                    OrderItem::desc(expr)
                } else {
                    OrderItem::asc(expr)
                };
                items.push(item.nulls_last());
            }
            items.extend(self.canonical_order(shape, &dim_column)?);
            query = query.order_by(items).limit(bound.limit);
        }
        Ok(query)
    }

    // =========================================================================
    // Aggregate substitution
    // =========================================================================

    /// The smallest aggregate table that can answer a non-empty read,
    /// if any. Caption matches and ordinal-ordered bounds disqualify
    /// substitution: rollup tables carry neither captions nor ordinal
    /// columns.
    fn covering_aggregate<'c>(
        &self,
        base: &'c Cube,
        shape: &RowShape,
        constraint: &SqlConstraint,
    ) -> Result<Option<&'c AggTable>, SqlExecutionError> {
        if !self.config.aggregates_enabled() || base.aggregates.is_empty() {
            return Ok(None);
        }
        if let Some(having) = &constraint.having {
            let mut matches = Vec::new();
            collect_matches(having, &mut matches);
            if !matches.is_empty() {
                return Ok(None);
            }
        }
        let bounded = constraint.bound.is_some();

        let mut levels: BTreeSet<LevelKey> = BTreeSet::new();
        for slot in &shape.slots {
            for level_id in &slot.levels {
                let level = self.catalog.level(*level_id);
                if bounded && level.ordinal_column.is_some() {
                    return Ok(None);
                }
                levels.insert(level.key.clone());
            }
        }
        for restriction in &constraint.restrictions {
            let hierarchy = self.hierarchy(&restriction.hierarchy)?;
            if base.usage(hierarchy.id).is_none() {
                continue;
            }
            group_levels(&restriction.groups, &mut levels);
        }
        for filter in &constraint.role {
            let hierarchy = self.hierarchy(&filter.hierarchy)?;
            if base.usage(hierarchy.id).is_none() {
                continue;
            }
            group_levels(&filter.groups, &mut levels);
        }

        // Every scoped measure this base resolves must both exist in
        // the rollup and roll up losslessly. Ratios and averages never
        // do.
        let mut measures = Vec::new();
        for key in &constraint.measures {
            let Some(measure) = base.measure(key) else {
                continue;
            };
            match measure.plain_column() {
                Some((_, agg)) if agg != Aggregator::Avg => measures.push(key),
                _ => return Ok(None),
            }
        }

        Ok(base
            .aggregates
            .iter()
            .filter(|agg| {
                levels.iter().all(|level| agg.covers_level(level))
                    && measures.iter().all(|&key| agg.covers_measure(key))
            })
            .min_by_key(|agg| agg.row_count))
    }

    /// Non-empty read answered from a rollup table: no dimension joins,
    /// level keys come off the rollup's flattened columns.
    fn aggregate_select(
        &self,
        base: &Cube,
        agg: &'_ AggTable,
        shape: &RowShape,
        target: &CacheTarget,
        constraint: &SqlConstraint,
    ) -> Result<SelectQuery, SqlExecutionError> {
        let col = |level: &Level| -> Result<SqlExpr, SqlExecutionError> {
            agg.level_columns
                .get(&level.key)
                .map(|column| tcol(&agg.name, column))
                .ok_or_else(|| {
                    SqlExecutionError::Lowering(format!(
                        "aggregate table {} has no column for {}",
                        agg.name, level.key
                    ))
                })
        };

        let mut query = SelectQuery::new(TableRef::new(&agg.name));
        query = self.select_keys(query, shape, &col)?;

        for slot in target.slots() {
            if let Some(filter) = self.slot_filter(slot, &col)? {
                query = query.filter(filter);
            }
        }
        for restriction in &constraint.restrictions {
            let hierarchy = self.hierarchy(&restriction.hierarchy)?;
            if base.usage(hierarchy.id).is_none() {
                continue;
            }
            query = query.filter(self.groups_expr(&restriction.groups, &col)?);
        }
        for filter in &constraint.role {
            let hierarchy = self.hierarchy(&filter.hierarchy)?;
            if base.usage(hierarchy.id).is_none() {
                continue;
            }
            query = query.filter(self.groups_expr(&filter.groups, &col)?);
        }
        let probes: Vec<SqlExpr> = constraint
            .measures
            .iter()
            .filter_map(|key| agg.measure_columns.get(key))
            .map(|column| tcol(&agg.name, column).is_not_null())
            .collect();
        if !probes.is_empty() {
            query = query.filter(or_all(probes));
        }

        query = query.group_by(self.group_columns(shape, constraint, &col)?);

        if let Some(having) = &constraint.having {
            let measure = |key: &MeasureKey| self.rollup_aggregate(base, agg, key);
            query = query.having(self.having_expr(having, &measure)?);
        }
        if let Some(bound) = &constraint.bound {
            let mut items = Vec::new();
            if let Some(order) = &bound.order {
                let expr = self.rollup_aggregate(base, agg, &order.measure)?;
                let item = if order.desc {
                    OrderItem::desc(expr)
                } else {
                    OrderItem::asc(expr)
                };
                items.push(item.nulls_last());
            }
            items.extend(self.canonical_order(shape, &col)?);
            query = query.order_by(items).limit(bound.limit);
        }
        Ok(query)
    }

    // =========================================================================
    // Shared pieces
    // =========================================================================

    /// Aliased key columns `c0..cN`, slot order then chain order. The
    /// aliases are the union glue and the row-decoding contract.
    fn select_keys(
        &self,
        mut query: SelectQuery,
        shape: &RowShape,
        col: ColumnFn<'_>,
    ) -> Result<SelectQuery, SqlExecutionError> {
        let mut index = 0;
        for slot in &shape.slots {
            for level_id in &slot.levels {
                let level = self.catalog.level(*level_id);
                query = query.column(SelectColumn::aliased(col(level)?, &format!("c{}", index)));
                index += 1;
            }
        }
        Ok(query)
    }

    /// Extra output columns for a bounded DISTINCT read. Engines that
    /// enforce the DISTINCT ordering rule need every sort expression,
    /// ordinal columns and NULL flags included, in the select list.
    fn select_order_columns(&self, mut query: SelectQuery, shape: &RowShape) -> SelectQuery {
        let mut ordinals = 0;
        let mut flags = 0;
        for slot in &shape.slots {
            for level_id in &slot.levels {
                let level = self.catalog.level(*level_id);
                let sort = match &level.ordinal_column {
                    Some(column) => {
                        let expr = tcol(&level.table, column);
                        query = query
                            .column(SelectColumn::aliased(expr.clone(), &format!("o{}", ordinals)));
                        ordinals += 1;
                        expr
                    }
                    None => tcol(&level.table, &level.key_column),
                };
                if level.nullable {
                    query = query
                        .column(SelectColumn::aliased(sort.is_null(), &format!("n{}", flags)));
                    flags += 1;
                }
            }
        }
        query
    }

    /// GROUP BY list: chain key columns, plus ordinal columns when a
    /// bound makes SQL-side order load-bearing, plus the caption
    /// columns HAVING matches reference.
    fn group_columns(
        &self,
        shape: &RowShape,
        constraint: &SqlConstraint,
        col: ColumnFn<'_>,
    ) -> Result<Vec<SqlExpr>, SqlExecutionError> {
        let mut group = Vec::new();
        for slot in &shape.slots {
            for level_id in &slot.levels {
                let level = self.catalog.level(*level_id);
                push_unique(&mut group, col(level)?);
                if constraint.bound.is_some() {
                    if let Some(column) = &level.ordinal_column {
                        push_unique(&mut group, tcol(&level.table, column));
                    }
                }
            }
        }
        if let Some(having) = &constraint.having {
            let mut matched = Vec::new();
            collect_matches(having, &mut matched);
            for key in &matched {
                let level = self.level(key)?;
                let caption = level.caption_column.as_deref().unwrap_or(&level.key_column);
                push_unique(&mut group, tcol(&level.table, caption));
            }
        }
        Ok(group)
    }

    /// Ascending chain order, root level first: ordinal column when the
    /// level declares one, key column otherwise, NULL keys last.
    fn canonical_order(
        &self,
        shape: &RowShape,
        col: ColumnFn<'_>,
    ) -> Result<Vec<OrderItem>, SqlExecutionError> {
        let mut items = Vec::new();
        for slot in &shape.slots {
            for level_id in &slot.levels {
                let level = self.catalog.level(*level_id);
                let expr = match &level.ordinal_column {
                    Some(column) => tcol(&level.table, column),
                    None => col(level)?,
                };
                let item = OrderItem::asc(expr);
                items.push(if level.nullable { item.nulls_last() } else { item });
            }
        }
        Ok(items)
    }

    /// Fact join for one hierarchy: primary table keyed by the cube's
    /// foreign key column, then only the snowflake hops the statement
    /// actually reads.
    fn join_dimension(
        &self,
        query: SelectQuery,
        fact: &str,
        fact_column: &str,
        hierarchy: &Hierarchy,
        tables: &BTreeSet<String>,
    ) -> SelectQuery {
        let mut query = query.inner_join(
            TableRef::new(&hierarchy.primary_table),
            tcol(fact, fact_column).eq(tcol(&hierarchy.primary_table, &hierarchy.primary_key)),
        );
        for hop in snowflake_hops(hierarchy, tables) {
            query = query.inner_join(
                TableRef::new(&hop.right_table),
                tcol(&hop.left_table, &hop.left_column)
                    .eq(tcol(&hop.right_table, &hop.right_column)),
            );
        }
        query
    }

    /// Dimension tables each hierarchy's statement text must reach.
    fn needed_tables(
        &self,
        shape: &RowShape,
        constraint: &SqlConstraint,
    ) -> Result<BTreeMap<HierarchyId, BTreeSet<String>>, SqlExecutionError> {
        let mut needed: BTreeMap<HierarchyId, BTreeSet<String>> = BTreeMap::new();
        for slot in &shape.slots {
            let tables = needed.entry(slot.hierarchy).or_default();
            for level_id in &slot.levels {
                tables.insert(self.catalog.level(*level_id).table.clone());
            }
        }
        for restriction in &constraint.restrictions {
            let hierarchy = self.hierarchy(&restriction.hierarchy)?;
            let tables = needed.entry(hierarchy.id).or_default();
            self.group_tables(&restriction.groups, tables)?;
        }
        for filter in &constraint.role {
            let hierarchy = self.hierarchy(&filter.hierarchy)?;
            let tables = needed.entry(hierarchy.id).or_default();
            self.group_tables(&filter.groups, tables)?;
        }
        if let Some(having) = &constraint.having {
            let mut matched = Vec::new();
            collect_matches(having, &mut matched);
            for key in &matched {
                let level = self.level(key)?;
                needed
                    .entry(level.hierarchy)
                    .or_default()
                    .insert(level.table.clone());
            }
        }
        Ok(needed)
    }

    fn group_tables(
        &self,
        groups: &[MemberGroup],
        tables: &mut BTreeSet<String>,
    ) -> Result<(), SqlExecutionError> {
        for group in groups {
            for prefix in &group.prefix {
                tables.insert(self.level(&prefix.level)?.table.clone());
            }
            tables.insert(self.level(&group.level)?.table.clone());
        }
        Ok(())
    }

    /// Ancestor-path equality for `Children` and `Descendants` slots.
    /// The parent is part of the cache target rather than the
    /// constraint, so its filter is derived here.
    fn slot_filter(
        &self,
        slot: &TargetSlot,
        col: ColumnFn<'_>,
    ) -> Result<Option<SqlExpr>, SqlExecutionError> {
        let member = match slot {
            TargetSlot::Level(_) => return Ok(None),
            TargetSlot::Children(parent) => self.member(parent)?,
            TargetSlot::Descendants { ancestor, .. } => self.member(ancestor)?,
        };
        let hierarchy = self.catalog.hierarchy(member.hierarchy);
        let path = self.catalog.arena().key_path(member.id);
        let mut parts = Vec::with_capacity(path.len());
        for (depth, value) in path.iter().enumerate() {
            let level_id = hierarchy.level_at_depth(depth + 1).ok_or_else(|| {
                SqlExecutionError::Lowering(format!(
                    "{} is deeper than its hierarchy",
                    member.key
                ))
            })?;
            let column = col(self.catalog.level(level_id))?;
            parts.push(key_filter(column, value));
        }
        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(and_all(parts)))
    }

    /// OR of a restriction's groups.
    fn groups_expr(
        &self,
        groups: &[MemberGroup],
        col: ColumnFn<'_>,
    ) -> Result<SqlExpr, SqlExecutionError> {
        let branches = groups
            .iter()
            .map(|group| self.group_expr(group, col))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(or_all(branches))
    }

    /// One group: ancestor prefix equalities ANDed with the leaf-level
    /// membership test. NULL keys become IS NULL branches.
    fn group_expr(
        &self,
        group: &MemberGroup,
        col: ColumnFn<'_>,
    ) -> Result<SqlExpr, SqlExecutionError> {
        let mut parts = Vec::with_capacity(group.prefix.len() + 1);
        for prefix in &group.prefix {
            let column = col(self.level(&prefix.level)?)?;
            parts.push(key_filter(column, &prefix.value));
        }

        let column = col(self.level(&group.level)?)?;
        let mut literals = Vec::new();
        let mut with_null = false;
        for value in &group.values {
            match key_literal(value) {
                Some(literal) => literals.push(literal),
                None => with_null = true,
            }
        }
        let matched = if literals.is_empty() {
            None
        } else if literals.len() == 1 {
            literals.pop().map(|literal| column.clone().eq(literal))
        } else {
            Some(column.clone().in_list(literals))
        };
        let leaf = match (matched, with_null) {
            (None, _) => column.is_null(),
            (Some(matched), false) => matched,
            (Some(matched), true) => or_all(vec![matched, column.is_null()]),
        };
        parts.push(leaf);
        Ok(and_all(parts))
    }

    fn having_expr(
        &self,
        filter: &HavingFilter,
        measure: MeasureFn<'_>,
    ) -> Result<SqlExpr, SqlExecutionError> {
        Ok(match filter {
            HavingFilter::Compare {
                measure: key,
                op,
                value,
            } => measure(key)?.compare(*op, lit_float(*value)),
            HavingFilter::Matches { level, pattern } => {
                let level = self.level(level)?;
                let caption = level.caption_column.as_deref().unwrap_or(&level.key_column);
                SqlExpr::RegexMatch {
                    expr: Box::new(tcol(&level.table, caption)),
                    pattern: pattern.clone(),
                }
            }
            HavingFilter::Not(inner) => {
                SqlExpr::Not(Box::new(self.having_expr(inner, measure)?))
            }
            HavingFilter::And(parts) => and_all(
                parts
                    .iter()
                    .map(|part| self.having_expr(part, measure))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            HavingFilter::Or(parts) => or_all(
                parts
                    .iter()
                    .map(|part| self.having_expr(part, measure))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }

    /// A measure aggregated straight off the fact table.
    fn measure_aggregate(
        &self,
        base: &Cube,
        fact: &str,
        key: &MeasureKey,
    ) -> Result<SqlExpr, SqlExecutionError> {
        let measure = base.measure(key).ok_or_else(|| {
            SqlExecutionError::Lowering(format!(
                "measure {} is not in cube {}",
                key, base.name
            ))
        })?;
        Ok(measure_over(fact, &measure.expr))
    }

    /// A measure rolled up from pre-aggregated rows. Partial COUNTs
    /// combine by SUM.
    fn rollup_aggregate(
        &self,
        base: &Cube,
        agg: &AggTable,
        key: &MeasureKey,
    ) -> Result<SqlExpr, SqlExecutionError> {
        let column = agg.measure_columns.get(key).ok_or_else(|| {
            SqlExecutionError::Lowering(format!(
                "aggregate table {} has no column for {}",
                agg.name, key
            ))
        })?;
        let measure = base.measure(key).ok_or_else(|| {
            SqlExecutionError::Lowering(format!(
                "measure {} is not in cube {}",
                key, base.name
            ))
        })?;
        let func = match measure.plain_column() {
            Some((_, Aggregator::Sum)) | Some((_, Aggregator::Count)) => "SUM",
            Some((_, Aggregator::Min)) => "MIN",
            Some((_, Aggregator::Max)) => "MAX",
            _ => {
                return Err(SqlExecutionError::Lowering(format!(
                    "measure {} does not roll up from {}",
                    key, agg.name
                )))
            }
        };
        Ok(tcol(&agg.name, column).agg(func))
    }

    // =========================================================================
    // Catalog lookups
    // =========================================================================

    fn hierarchy(&self, key: &HierarchyKey) -> Result<&Hierarchy, SqlExecutionError> {
        self.catalog
            .hierarchy_by_key(key)
            .ok_or_else(|| SqlExecutionError::Lowering(format!("unknown hierarchy {}", key)))
    }

    fn level(&self, key: &LevelKey) -> Result<&Level, SqlExecutionError> {
        lookup_level(self.catalog, key)
    }

    fn member(&self, key: &MemberKey) -> Result<&Member, SqlExecutionError> {
        lookup_member(self.catalog, key)
    }
}

fn lookup_level<'c>(catalog: &'c Catalog, key: &LevelKey) -> Result<&'c Level, SqlExecutionError> {
    catalog
        .level_by_key(key)
        .ok_or_else(|| SqlExecutionError::Lowering(format!("unknown level {}", key)))
}

fn lookup_member<'c>(
    catalog: &'c Catalog,
    key: &MemberKey,
) -> Result<&'c Member, SqlExecutionError> {
    catalog
        .member_by_key(key)
        .ok_or_else(|| SqlExecutionError::Lowering(format!("unknown member {}", key)))
}

// =============================================================================
// Free helpers
// =============================================================================

fn dim_column(level: &Level) -> Result<SqlExpr, SqlExecutionError> {
    Ok(tcol(&level.table, &level.key_column))
}

fn key_literal(value: &KeyValue) -> Option<SqlExpr> {
    match value {
        KeyValue::Int(v) => Some(lit_int(*v)),
        KeyValue::Str(s) => Some(lit_str(s)),
        KeyValue::Null => None,
    }
}

pub(crate) fn key_filter(column: SqlExpr, value: &KeyValue) -> SqlExpr {
    match key_literal(value) {
        Some(literal) => column.eq(literal),
        None => column.is_null(),
    }
}

/// The snowflake hops a statement needs, cut at the outermost table it
/// reads. Hops are declared outward from the primary table, so the
/// prefix up to that table keeps the join chain connected.
pub(crate) fn snowflake_hops<'h>(
    hierarchy: &'h Hierarchy,
    tables: &BTreeSet<String>,
) -> &'h [SnowflakeJoin] {
    match hierarchy
        .joins
        .iter()
        .rposition(|hop| tables.contains(&hop.right_table))
    {
        Some(last) => &hierarchy.joins[..=last],
        None => &[],
    }
}

fn push_unique(list: &mut Vec<SqlExpr>, expr: SqlExpr) {
    if !list.contains(&expr) {
        list.push(expr);
    }
}

fn collect_matches(filter: &HavingFilter, into: &mut Vec<LevelKey>) {
    match filter {
        HavingFilter::Matches { level, .. } => {
            if !into.contains(level) {
                into.push(level.clone());
            }
        }
        HavingFilter::Compare { .. } => {}
        HavingFilter::Not(inner) => collect_matches(inner, into),
        HavingFilter::And(parts) | HavingFilter::Or(parts) => {
            for part in parts {
                collect_matches(part, into);
            }
        }
    }
}

fn group_levels(groups: &[MemberGroup], into: &mut BTreeSet<LevelKey>) {
    for group in groups {
        for prefix in &group.prefix {
            into.insert(prefix.level.clone());
        }
        into.insert(group.level.clone());
    }
}

/// A row with every scoped measure NULL contributes nothing, so the
/// probe is the OR of the plain fact columns' NOT NULL tests. Derived
/// measures have no single column to probe; row existence stands in.
fn non_empty_probe(base: &Cube, fact: &str, measures: &[MeasureKey]) -> Option<SqlExpr> {
    let probes: Vec<SqlExpr> = measures
        .iter()
        .filter_map(|key| base.measure(key))
        .filter_map(|measure| measure.plain_column())
        .map(|(column, _)| tcol(fact, column).is_not_null())
        .collect();
    if probes.is_empty() {
        None
    } else {
        Some(or_all(probes))
    }
}

pub(crate) fn measure_over(fact: &str, expr: &MeasureExpr) -> SqlExpr {
    match expr {
        MeasureExpr::Column { column, agg } => tcol(fact, column).agg(agg.sql_name()),
        MeasureExpr::Arith { left, op, right } => SqlExpr::Binary {
            left: Box::new(measure_over(fact, left)),
            op: (*op).into(),
            right: Box::new(measure_over(fact, right)),
        },
        MeasureExpr::Literal(value) => lit_float(*value),
    }
}

fn collect_fact_columns(expr: &MeasureExpr, into: &mut Vec<String>) {
    match expr {
        MeasureExpr::Column { column, .. } => {
            if !into.contains(column) {
                into.push(column.clone());
            }
        }
        MeasureExpr::Arith { left, right, .. } => {
            collect_fact_columns(left, into);
            collect_fact_columns(right, into);
        }
        MeasureExpr::Literal(_) => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
