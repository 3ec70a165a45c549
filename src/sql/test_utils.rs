//! Test-only SQL validation.
//!
//! Every statement the generator emits is round-tripped through
//! sqlparser-rs for the dialect it was serialized for, so syntax
//! breakage shows up in unit tests instead of against a warehouse.

use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use super::dialect::Dialect;

/// Panics unless `sql` parses under the given dialect's grammar.
pub fn validate_sql(sql: &str, dialect: Dialect) {
    let parser_dialect: Box<dyn sqlparser::dialect::Dialect> = match dialect {
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
    };

    if let Err(e) = Parser::parse_sql(&*parser_dialect, sql) {
        panic!("invalid SQL for {:?}: {}\nSQL: {}", dialect, e, sql);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_sql() {
        validate_sql("SELECT DISTINCT \"a\".\"b\" AS \"c0\" FROM \"a\"", Dialect::Sqlite);
        validate_sql("SELECT \"x\" FROM \"t\" WHERE \"x\" ~ 'pat'", Dialect::Postgres);
        validate_sql("SELECT `x` FROM `t` LIMIT 5", Dialect::MySql);
    }

    #[test]
    #[should_panic(expected = "invalid SQL")]
    fn test_rejects_broken_sql() {
        validate_sql("SELEC * FORM users", Dialect::Sqlite);
    }
}
