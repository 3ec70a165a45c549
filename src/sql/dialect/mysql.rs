//! MySQL SQL dialect.
//!
//! MySQL differences from ANSI:
//! - Backtick identifier quoting (`` `name` ``)
//! - Backslash is an escape character inside string literals
//! - REGEXP_LIKE() for regex matching (8.0+, ICU engine)
//! - LIMIT ... for pagination

use super::super::token::{Token, TokenStream};
use super::helpers;
use super::SqlDialect;

/// MySQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        // MySQL treats backslash as an escape character inside string
        // literals, so regex patterns need their backslashes doubled.
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    }

    // Uses default emit_limit

    fn emit_regex_match(&self, target: &TokenStream, pattern: &str) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::FunctionName("regexp_like".into()))
            .lparen()
            .append(target)
            .comma()
            .space()
            .push(Token::LitString(pattern.into()))
            .rparen();
        ts
    }
}
