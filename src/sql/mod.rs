//! Offline schema loading from SQL dumps.

mod dialect;
mod lexer;
mod parser;
mod types;

pub use dialect::Dialect;
pub use parser::{DEFAULT_SCHEMA, SqlParseError, load_ddl};
