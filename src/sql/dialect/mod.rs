//! SQL Dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for the dialect
//! differences constraint SQL actually hits:
//!
//! - Identifier quoting: `"` (SQLite/Postgres) vs `` ` `` (MySQL)
//! - String literal escaping (MySQL backslash rules)
//! - Regex matching: registered `regexp()` function (SQLite), `~` operator
//!   (Postgres), `REGEXP_LIKE()` (MySQL)
//! - Row limits
//!
//! Regex patterns carry their case-insensitivity inline (`(?i)`), so no
//! dialect needs a separate case-folding step.
//!
//! # Usage
//!
//! ```ignore
//! use opal::sql::dialect::{Dialect, SqlDialect};
//!
//! let dialect = Dialect::Postgres;
//! let quoted = dialect.quote_identifier("customer");  // "customer"
//! ```

pub mod helpers;
mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use super::token::TokenStream;

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// Implementations handle dialect-specific syntax differences.
/// The default implementations follow ANSI SQL where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column, alias).
    ///
    /// - SQLite/PostgreSQL: `"identifier"`
    /// - MySQL: `` `identifier` ``
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a string literal.
    ///
    /// All dialects use single quotes with `''` for escaping.
    /// Override where the engine adds escape rules of its own.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// Emit a row limit clause.
    fn emit_limit(&self, limit: u64) -> TokenStream {
        helpers::emit_limit_standard(limit)
    }

    /// Emit a regex match of `target` against `pattern`.
    ///
    /// The pattern is a Rust-regex-style pattern with inline flags; every
    /// supported engine honors `(?i)`.
    fn emit_regex_match(&self, target: &TokenStream, pattern: &str) -> TokenStream;
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Sqlite => &Sqlite,
            Dialect::Postgres => &Postgres,
            Dialect::MySql => &MySql,
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn emit_limit(&self, limit: u64) -> TokenStream {
        self.dialect().emit_limit(limit)
    }

    fn emit_regex_match(&self, target: &TokenStream, pattern: &str) -> TokenStream {
        self.dialect().emit_regex_match(target, pattern)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
