//! SQLite-backed warehouse: executor and cell reader in one.
//!
//! The connection registers a two-argument `REGEXP(pattern, target)`
//! function because generated statements call it for caption matches.
//! Patterns carry their flags inline, so compilation happens per call
//! and a NULL target never matches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::model::catalog::Catalog;
use crate::model::hierarchy::HierarchyId;
use crate::model::member::MemberId;
use crate::native::events::{NativeEvent, NativeEventSink};
use crate::sql::generator::{key_filter, measure_over, snowflake_hops};
use crate::sql::select::{and_all, or_all, tcol, SelectColumn, SelectQuery, SqlExpr, TableRef};
use crate::sql::{
    Dialect, SqlExecutionError, SqlExecutor, SqlGenerator, SqlRequest, SqlRow, SqlValue,
};

use super::{CellReader, CellRequest};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a fresh in-memory database with `REGEXP` registered.
    pub fn open_in_memory() -> Result<Self, SqlExecutionError> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        register_regexp(&conn).map_err(sql_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run raw statements, for schema setup and data loading.
    pub fn execute_batch(&self, sql: &str) -> Result<(), SqlExecutionError> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(sql)
            .map_err(sql_error)
    }
}

fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let regex = Regex::new(&pattern)
                .map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Null | ValueRef::Blob(_) => false,
                ValueRef::Text(bytes) => regex.is_match(&String::from_utf8_lossy(bytes)),
                ValueRef::Integer(v) => regex.is_match(&v.to_string()),
                ValueRef::Real(v) => regex.is_match(&v.to_string()),
            };
            Ok(matched)
        },
    )
}

fn sql_error(err: rusqlite::Error) -> SqlExecutionError {
    SqlExecutionError::Execution(err.to_string())
}

// =============================================================================
// Native reads
// =============================================================================

impl SqlExecutor for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(
        &self,
        request: &SqlRequest<'_>,
        sink: &dyn NativeEventSink,
    ) -> Result<Vec<SqlRow>, SqlExecutionError> {
        let generator = SqlGenerator::new(request.catalog, request.config, self.dialect());
        let generated = generator.generate(request.target, request.constraint)?;
        sink.notify(NativeEvent::ExecutingSql(generated.sql.clone()));

        // Bounded statements append ordering columns after the keys;
        // only the first `width` columns belong to the row shape.
        let width = generated.shape.width();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&generated.sql).map_err(sql_error)?;
        let mut rows = stmt.query([]).map_err(sql_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_error)? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(read_value(row, index)?);
            }
            out.push(values);
        }
        Ok(out)
    }
}

fn read_value(row: &rusqlite::Row<'_>, index: usize) -> Result<SqlValue, SqlExecutionError> {
    Ok(match row.get_ref(index).map_err(sql_error)? {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => {
            return Err(SqlExecutionError::Execution(format!(
                "key column {} holds a blob",
                index
            )))
        }
    })
}

// =============================================================================
// Cell reads
// =============================================================================

impl CellReader for SqliteStore {
    fn cell(&self, request: &CellRequest<'_>) -> Result<Option<f64>, SqlExecutionError> {
        // A scope with no visible members excludes every fact row.
        if request.scopes.iter().any(|(_, members)| members.is_empty()) {
            return Ok(None);
        }
        let sql = cell_select(request)?;
        let conn = self.conn.lock().unwrap();
        conn.query_row(&sql, [], |row| row.get::<_, Option<f64>>(0))
            .map_err(sql_error)
    }
}

/// One aggregate over the fact table, joined to the dimension tables
/// the coordinates touch and filtered by each member's full key path.
fn cell_select(request: &CellRequest<'_>) -> Result<String, SqlExecutionError> {
    let catalog = request.catalog;
    let bases = catalog.base_cubes_for(request.cube, std::slice::from_ref(request.measure));
    let base = bases.first().ok_or_else(|| {
        SqlExecutionError::Lowering(format!(
            "no base cube of {} carries {}",
            catalog.cube_name(request.cube),
            request.measure
        ))
    })?;
    let measure = base.measure(request.measure).ok_or_else(|| {
        SqlExecutionError::Lowering(format!("unknown measure {}", request.measure))
    })?;
    let fact = base.fact_table.as_str();

    let mut filters: BTreeMap<HierarchyId, Vec<SqlExpr>> = BTreeMap::new();
    let mut tables: BTreeMap<HierarchyId, BTreeSet<String>> = BTreeMap::new();
    for &coordinate in request.coordinates {
        let member = catalog.member(coordinate);
        if member.is_all() || base.usage(member.hierarchy).is_none() {
            continue;
        }
        let filter =
            member_path_filter(catalog, coordinate, tables.entry(member.hierarchy).or_default())?;
        filters.entry(member.hierarchy).or_default().push(filter);
    }
    for (hierarchy, members) in request.scopes {
        if members.iter().any(|&m| catalog.member(m).is_all())
            || base.usage(*hierarchy).is_none()
        {
            continue;
        }
        let branches = members
            .iter()
            .map(|&m| member_path_filter(catalog, m, tables.entry(*hierarchy).or_default()))
            .collect::<Result<Vec<_>, _>>()?;
        filters.entry(*hierarchy).or_default().push(or_all(branches));
    }

    let mut query = SelectQuery::new(TableRef::new(fact))
        .column(SelectColumn::aliased(measure_over(fact, &measure.expr), "m0"));
    let empty = BTreeSet::new();
    for (hierarchy_id, parts) in filters {
        let hierarchy = catalog.hierarchy(hierarchy_id);
        let Some(usage) = base.usage(hierarchy_id) else {
            continue;
        };
        query = query.inner_join(
            TableRef::new(&hierarchy.primary_table),
            tcol(fact, &usage.fact_column)
                .eq(tcol(&hierarchy.primary_table, &hierarchy.primary_key)),
        );
        for hop in snowflake_hops(hierarchy, tables.get(&hierarchy_id).unwrap_or(&empty)) {
            query = query.inner_join(
                TableRef::new(&hop.right_table),
                tcol(&hop.left_table, &hop.left_column)
                    .eq(tcol(&hop.right_table, &hop.right_column)),
            );
        }
        query = query.filter(and_all(parts));
    }

    Ok(query.to_sql(Dialect::Sqlite))
}

/// AND of key tests down the member's level chain. Ancestor columns
/// keep ragged NULL keys unambiguous.
fn member_path_filter(
    catalog: &Catalog,
    member: MemberId,
    tables: &mut BTreeSet<String>,
) -> Result<SqlExpr, SqlExecutionError> {
    let record = catalog.member(member);
    if !record.is_stored() {
        return Err(SqlExecutionError::Lowering(format!(
            "{} is not a stored member",
            record.key
        )));
    }
    let hierarchy = catalog.hierarchy(record.hierarchy);
    let path = catalog.arena().key_path(member);
    let mut parts = Vec::with_capacity(path.len());
    for (level_id, value) in hierarchy.levels.iter().zip(&path) {
        let level = catalog.level(*level_id);
        tables.insert(level.table.clone());
        parts.push(key_filter(tcol(&level.table, &level.key_column), value));
    }
    Ok(and_all(parts))
}
