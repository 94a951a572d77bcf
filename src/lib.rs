//! Compile GraphQL queries into single SQL statements.
//!
//! A query is parsed, resolved against the database schema and the
//! requesting role's permissions, and rendered as one parameterized
//! statement that builds the whole JSON response inside the database.

pub mod allow;
pub mod ast;
pub mod cache;
pub mod config;
pub mod core;
pub mod cursor;
pub mod error;
pub mod exec;
pub mod lexer;
pub mod parser;
pub mod pool;
pub mod qcode;
pub mod remote;
pub mod render;
pub mod schema;
pub mod sql;

pub use crate::core::{Compiled, GraphSql, Request, Response};
pub use config::Config;
pub use error::Error;
pub use exec::{Database, PgDatabase};
pub use pool::PoolOptions;
pub use qcode::{Compiler, CompilerConfig, QCode};
pub use render::{Renderer, Statement};
pub use schema::{DBInfo, DBSchema};
pub use sql::Dialect;
