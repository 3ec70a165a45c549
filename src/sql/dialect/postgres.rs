//! PostgreSQL SQL dialect.
//!
//! PostgreSQL features used here:
//! - ANSI identifier quoting (`"`)
//! - Lowercase case folding for unquoted identifiers
//! - `~` regex-match operator honoring inline `(?i)` flags
//! - LIMIT ... for pagination

use super::super::token::{Token, TokenStream};
use super::helpers;
use super::SqlDialect;

/// PostgreSQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    // Uses default quote_string and emit_limit

    fn emit_regex_match(&self, target: &TokenStream, pattern: &str) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.append(target)
            .space()
            .push(Token::Raw("~".into()))
            .space()
            .push(Token::LitString(pattern.into()));
        ts
    }
}
