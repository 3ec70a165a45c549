//! SELECT statement model for constraint SQL.
//!
//! A deliberately small query AST: member reads only ever produce
//! single-block SELECTs over a star/snowflake join, optionally combined
//! with UNION for virtual cubes. Everything renders through the token
//! layer so dialect differences stay in one place.

use super::dialect::{Dialect, SqlDialect};
use super::token::{Token, TokenStream};
use crate::expr::CompareOp;
use crate::model::cube::ArithOp;

// =============================================================================
// Expressions
// =============================================================================

/// Binary operator in a scalar expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn token(self) -> Token {
        match self {
            BinaryOp::Eq => Token::Eq,
            BinaryOp::Ne => Token::Ne,
            BinaryOp::Lt => Token::Lt,
            BinaryOp::Lte => Token::Lte,
            BinaryOp::Gt => Token::Gt,
            BinaryOp::Gte => Token::Gte,
            BinaryOp::Add => Token::Plus,
            BinaryOp::Sub => Token::Minus,
            BinaryOp::Mul => Token::Mul,
            BinaryOp::Div => Token::Div,
        }
    }

    fn is_arith(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }
}

impl From<CompareOp> for BinaryOp {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Eq => BinaryOp::Eq,
            CompareOp::Ne => BinaryOp::Ne,
            CompareOp::Lt => BinaryOp::Lt,
            CompareOp::Le => BinaryOp::Lte,
            CompareOp::Gt => BinaryOp::Gt,
            CompareOp::Ge => BinaryOp::Gte,
        }
    }
}

impl From<ArithOp> for BinaryOp {
    fn from(op: ArithOp) -> Self {
        match op {
            ArithOp::Add => BinaryOp::Add,
            ArithOp::Sub => BinaryOp::Sub,
            ArithOp::Mul => BinaryOp::Mul,
            ArithOp::Div => BinaryOp::Div,
        }
    }
}

/// A scalar SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// Table-qualified column.
    Column { table: String, column: String },
    LitInt(i64),
    LitFloat(f64),
    LitString(String),
    /// Aggregate call, e.g. `SUM(...)`.
    Aggregate {
        func: &'static str,
        arg: Box<SqlExpr>,
    },
    Binary {
        left: Box<SqlExpr>,
        op: BinaryOp,
        right: Box<SqlExpr>,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    IsNotNull(Box<SqlExpr>),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
    },
    /// Dialect-rendered regex match; the pattern carries inline flags.
    RegexMatch {
        expr: Box<SqlExpr>,
        pattern: String,
    },
}

/// Table-qualified column reference.
pub fn tcol(table: &str, column: &str) -> SqlExpr {
    SqlExpr::Column {
        table: table.into(),
        column: column.into(),
    }
}

pub fn lit_int(value: i64) -> SqlExpr {
    SqlExpr::LitInt(value)
}

pub fn lit_float(value: f64) -> SqlExpr {
    SqlExpr::LitFloat(value)
}

pub fn lit_str(value: &str) -> SqlExpr {
    SqlExpr::LitString(value.into())
}

/// Conjunction of parts; a single part stays bare.
pub fn and_all(mut parts: Vec<SqlExpr>) -> SqlExpr {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        SqlExpr::And(parts)
    }
}

/// Disjunction of parts; a single part stays bare.
pub fn or_all(mut parts: Vec<SqlExpr>) -> SqlExpr {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        SqlExpr::Or(parts)
    }
}

impl SqlExpr {
    pub fn compare(self, op: impl Into<BinaryOp>, other: SqlExpr) -> SqlExpr {
        SqlExpr::Binary {
            left: Box::new(self),
            op: op.into(),
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: SqlExpr) -> SqlExpr {
        self.compare(BinaryOp::Eq, other)
    }

    pub fn is_null(self) -> SqlExpr {
        SqlExpr::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> SqlExpr {
        SqlExpr::IsNotNull(Box::new(self))
    }

    pub fn in_list(self, list: Vec<SqlExpr>) -> SqlExpr {
        SqlExpr::InList {
            expr: Box::new(self),
            list,
        }
    }

    pub fn agg(self, func: &'static str) -> SqlExpr {
        SqlExpr::Aggregate {
            func,
            arg: Box::new(self),
        }
    }

    pub fn to_tokens(&self) -> TokenStream {
        self.to_tokens_for_dialect(Dialect::default())
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            SqlExpr::Column { table, column } => {
                ts.push(Token::Ident(table.clone()))
                    .push(Token::Dot)
                    .push(Token::Ident(column.clone()));
            }
            SqlExpr::LitInt(v) => {
                ts.push(Token::LitInt(*v));
            }
            SqlExpr::LitFloat(v) => {
                ts.push(Token::LitFloat(*v));
            }
            SqlExpr::LitString(v) => {
                ts.push(Token::LitString(v.clone()));
            }
            SqlExpr::Aggregate { func, arg } => {
                ts.push(Token::FunctionName((*func).into()))
                    .lparen()
                    .append(&arg.to_tokens_for_dialect(dialect))
                    .rparen();
            }
            SqlExpr::Binary { left, op, right } => {
                ts.append(&Self::operand(left, dialect));
                ts.space().push(op.token()).space();
                ts.append(&Self::operand(right, dialect));
            }
            SqlExpr::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        ts.space().push(Token::And).space();
                    }
                    ts.append(&Self::logical_operand(part, dialect));
                }
            }
            SqlExpr::Or(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        ts.space().push(Token::Or).space();
                    }
                    ts.append(&Self::logical_operand(part, dialect));
                }
            }
            SqlExpr::Not(inner) => {
                ts.push(Token::Not).space().lparen();
                ts.append(&inner.to_tokens_for_dialect(dialect));
                ts.rparen();
            }
            SqlExpr::IsNull(inner) => {
                ts.append(&inner.to_tokens_for_dialect(dialect));
                ts.space().push(Token::IsNull);
            }
            SqlExpr::IsNotNull(inner) => {
                ts.append(&inner.to_tokens_for_dialect(dialect));
                ts.space().push(Token::IsNotNull);
            }
            SqlExpr::InList { expr, list } => {
                debug_assert!(!list.is_empty(), "IN list must not be empty");
                ts.append(&expr.to_tokens_for_dialect(dialect));
                ts.space().push(Token::In).space().lparen();
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        ts.comma().space();
                    }
                    ts.append(&item.to_tokens_for_dialect(dialect));
                }
                ts.rparen();
            }
            SqlExpr::RegexMatch { expr, pattern } => {
                let target = expr.to_tokens_for_dialect(dialect);
                ts.append(&dialect.emit_regex_match(&target, pattern));
            }
        }
        ts
    }

    /// An operand of a binary operator. Nested arithmetic and nested logic
    /// are parenthesized so the tree reads back unambiguously.
    fn operand(operand: &SqlExpr, dialect: Dialect) -> TokenStream {
        let needs_parens = match operand {
            SqlExpr::Binary { op, .. } => op.is_arith(),
            SqlExpr::And(_) | SqlExpr::Or(_) => true,
            _ => false,
        };
        Self::wrap(operand, needs_parens, dialect)
    }

    /// An operand of AND/OR: bare for leaves and comparisons, wrapped for
    /// nested logic.
    fn logical_operand(operand: &SqlExpr, dialect: Dialect) -> TokenStream {
        let needs_parens = matches!(operand, SqlExpr::And(_) | SqlExpr::Or(_));
        Self::wrap(operand, needs_parens, dialect)
    }

    fn wrap(expr: &SqlExpr, parens: bool, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        if parens {
            ts.lparen();
            ts.append(&expr.to_tokens_for_dialect(dialect));
            ts.rparen();
        } else {
            ts.append(&expr.to_tokens_for_dialect(dialect));
        }
        ts
    }
}

// =============================================================================
// Table References and Joins
// =============================================================================

/// A named table reference.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub table: String,
}

impl TableRef {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Ident(self.table.clone()));
        ts
    }
}

/// What a JOIN attaches: a named table or a derived subquery.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Table(TableRef),
    Derived {
        query: Box<SelectQuery>,
        alias: String,
    },
}

impl TableSource {
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            TableSource::Table(table) => {
                ts.append(&table.to_tokens());
            }
            TableSource::Derived { query, alias } => {
                ts.lparen()
                    .append(&query.to_tokens_for_dialect(dialect))
                    .rparen()
                    .space()
                    .push(Token::As)
                    .space()
                    .push(Token::Ident(alias.clone()));
            }
        }
        ts
    }
}

/// Type of join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: TableSource,
    pub on: SqlExpr,
}

impl Join {
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match self.kind {
            JoinKind::Inner => ts.push(Token::Inner),
            JoinKind::Left => ts.push(Token::Left),
        };
        ts.space().push(Token::Join).space();
        ts.append(&self.source.to_tokens_for_dialect(dialect));
        ts.space().push(Token::On).space();
        ts.append(&self.on.to_tokens_for_dialect(dialect));
        ts
    }
}

// =============================================================================
// SELECT list and ORDER BY
// =============================================================================

/// A SELECT list item: expression with optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectColumn {
    pub fn new(expr: SqlExpr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: SqlExpr, alias: &str) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = self.expr.to_tokens_for_dialect(dialect);
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

/// One ORDER BY term.
///
/// `nulls_last` is emulated portably as `(expr IS NULL), expr` instead of
/// NULLS LAST, which MySQL never learned; the boolean sort key is identical
/// on every supported engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub desc: bool,
    pub nulls_last: bool,
}

impl OrderItem {
    pub fn asc(expr: SqlExpr) -> Self {
        Self {
            expr,
            desc: false,
            nulls_last: false,
        }
    }

    pub fn desc(expr: SqlExpr) -> Self {
        Self {
            expr,
            desc: true,
            nulls_last: false,
        }
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls_last = true;
        self
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        if self.nulls_last {
            ts.lparen()
                .append(&self.expr.to_tokens_for_dialect(dialect))
                .space()
                .push(Token::IsNull)
                .rparen()
                .comma()
                .space();
        }
        ts.append(&self.expr.to_tokens_for_dialect(dialect));
        if self.desc {
            ts.space().push(Token::Desc);
        }
        ts
    }
}

// =============================================================================
// SELECT statement
// =============================================================================

/// A single-block SELECT.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "SelectQuery has no effect until converted to SQL with to_sql()"]
pub struct SelectQuery {
    pub select: Vec<SelectColumn>,
    pub distinct: bool,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub where_clause: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    pub fn new(from: TableRef) -> Self {
        Self {
            select: vec![],
            distinct: false,
            from,
            joins: vec![],
            where_clause: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        }
    }

    pub fn column(mut self, column: SelectColumn) -> Self {
        self.select.push(column);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn join(mut self, kind: JoinKind, source: TableSource, on: SqlExpr) -> Self {
        self.joins.push(Join { kind, source, on });
        self
    }

    pub fn inner_join(self, table: TableRef, on: SqlExpr) -> Self {
        self.join(JoinKind::Inner, TableSource::Table(table), on)
    }

    pub fn left_join(self, source: TableSource, on: SqlExpr) -> Self {
        self.join(JoinKind::Left, source, on)
    }

    /// Add a WHERE condition (ANDed with existing conditions).
    pub fn filter(mut self, condition: SqlExpr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(SqlExpr::And(mut parts)) => {
                parts.push(condition);
                SqlExpr::And(parts)
            }
            Some(existing) => SqlExpr::And(vec![existing, condition]),
            None => condition,
        });
        self
    }

    pub fn group_by(mut self, exprs: Vec<SqlExpr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, condition: SqlExpr) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn order_by(mut self, items: Vec<OrderItem>) -> Self {
        self.order_by = items;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();

        // SELECT
        ts.push(Token::Select);
        if self.distinct {
            ts.space().push(Token::Distinct);
        }

        // Columns
        for (i, column) in self.select.iter().enumerate() {
            if i == 0 {
                ts.newline().indent(1);
            } else {
                ts.comma().newline().indent(1);
            }
            ts.append(&column.to_tokens_for_dialect(dialect));
        }

        // FROM
        ts.newline().push(Token::From).space();
        ts.append(&self.from.to_tokens());

        // JOINs
        for join in &self.joins {
            ts.newline();
            ts.append(&join.to_tokens_for_dialect(dialect));
        }

        // WHERE
        if let Some(where_clause) = &self.where_clause {
            ts.newline().push(Token::Where).space();
            ts.append(&where_clause.to_tokens_for_dialect(dialect));
        }

        // GROUP BY
        if !self.group_by.is_empty() {
            ts.newline().push(Token::GroupBy).space();
            for (i, expr) in self.group_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&expr.to_tokens_for_dialect(dialect));
            }
        }

        // HAVING
        if let Some(having) = &self.having {
            ts.newline().push(Token::Having).space();
            ts.append(&having.to_tokens_for_dialect(dialect));
        }

        // ORDER BY
        if !self.order_by.is_empty() {
            ts.newline().push(Token::OrderBy).space();
            for (i, item) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&item.to_tokens_for_dialect(dialect));
            }
        }

        // LIMIT
        if let Some(limit) = self.limit {
            ts.newline();
            ts.append(&dialect.emit_limit(limit));
        }

        ts
    }

    /// Generate SQL string for a specific dialect.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens_for_dialect(dialect).serialize(dialect)
    }
}

impl std::fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql(Dialect::default()))
    }
}

// =============================================================================
// UNION for virtual cubes
// =============================================================================

/// A duplicate-eliminating UNION of per-base-cube SELECTs.
///
/// Branches carry no ORDER BY or LIMIT of their own; SQLite rejects
/// parenthesized compound operands, so the combined ordering references
/// the shared output-column aliases instead.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "UnionQuery has no effect until converted to SQL with to_sql()"]
pub struct UnionQuery {
    pub branches: Vec<SelectQuery>,
    /// Output-column aliases to order the combined result by, ascending.
    pub order_by: Vec<String>,
}

impl UnionQuery {
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        for (i, branch) in self.branches.iter().enumerate() {
            if i > 0 {
                ts.newline().push(Token::Union).newline();
            }
            ts.append(&branch.to_tokens_for_dialect(dialect));
        }
        if !self.order_by.is_empty() {
            ts.newline().push(Token::OrderBy).space();
            for (i, alias) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.push(Token::Ident(alias.clone()));
            }
        }
        ts
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens_for_dialect(dialect).serialize(dialect)
    }
}

/// A complete generated statement: one SELECT, or a UNION of them.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Select(SelectQuery),
    Union(UnionQuery),
}

impl SqlStatement {
    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            SqlStatement::Select(query) => query.to_sql(dialect),
            SqlStatement::Union(union) => union.to_sql(dialect),
        }
    }
}

impl std::fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql(Dialect::default()))
    }
}

// =============================================================================
// Tests
// =============================================================================
