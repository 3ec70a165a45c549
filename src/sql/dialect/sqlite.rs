//! SQLite SQL dialect.
//!
//! SQLite is the reference dialect: the bundled executor runs generated
//! statements against it in tests and small deployments.
//!
//! - ANSI identifier quoting (`"`)
//! - LIMIT ... for pagination
//! - No built-in regex; the executor registers a `regexp(pattern, text)`
//!   scalar function, and matches render as a direct call to it

use super::super::token::{Token, TokenStream};
use super::helpers;
use super::SqlDialect;

/// SQLite SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    // Uses default quote_string and emit_limit

    fn emit_regex_match(&self, target: &TokenStream, pattern: &str) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::FunctionName("regexp".into()))
            .lparen()
            .push(Token::LitString(pattern.into()))
            .comma()
            .space()
            .append(target)
            .rparen();
        ts
    }
}
