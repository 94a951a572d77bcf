//! Top level error type returned by the service.

use thiserror::Error;

use crate::allow::AllowError;
use crate::config::ConfigError;
use crate::cursor::CursorError;
use crate::exec::ExecError;
use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::qcode::validate::ValidErr;
use crate::qcode::{CompileError, PermissionError};
use crate::remote::RemoteError;
use crate::render::RenderError;
use crate::schema::SchemaError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidErr>),

    #[error(transparent)]
    Compile(CompileError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("database error: {source}{}", sql_suffix(.sql))]
    Execution {
        source: ExecError,
        /// Only set when debug is enabled
        sql: Option<String>,
    },

    #[error("query not found in allow list: {0}")]
    UnknownQuery(String),

    #[error(transparent)]
    Allow(AllowError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// True for errors caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Error::Execution { .. } | Error::Config(_) | Error::Remote(_))
    }
}

fn join_errors(errs: &[ValidErr]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn sql_suffix(sql: &Option<String>) -> String {
    match sql {
        Some(s) => format!(" (sql: {})", s),
        None => String::new(),
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::Parse(e) => Error::Parse(e),
            CompileError::Schema(e) => Error::Schema(e),
            CompileError::Permission(e) => Error::Permission(e),
            CompileError::Validation(errs) => Error::Validation(errs),
            e => Error::Compile(e),
        }
    }
}

impl From<LexError> for Error {
    fn from(e: LexError) -> Self {
        Error::Parse(ParseError::Lex(e))
    }
}

impl From<ExecError> for Error {
    fn from(source: ExecError) -> Self {
        Error::Execution { source, sql: None }
    }
}

impl From<AllowError> for Error {
    fn from(e: AllowError) -> Self {
        match e {
            AllowError::NotFound(name) => Error::UnknownQuery(name),
            e => Error::Allow(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_map_to_taxonomy() {
        let e: Error = CompileError::Permission(PermissionError::RequiredVar("user_id".into())).into();
        assert!(matches!(e, Error::Permission(_)));
        assert_eq!(e.to_string(), "required variable user_id must be set");

        let e: Error = CompileError::Schema(SchemaError::TableNotFound("nope".into())).into();
        assert!(matches!(e, Error::Schema(_)));

        let e: Error = AllowError::NotFound("getUsers".into()).into();
        assert!(matches!(e, Error::UnknownQuery(_)));
        assert!(e.is_client_error());
    }

    #[test]
    fn test_validation_errors_are_listed() {
        let e = Error::Validation(vec![
            ValidErr::new("email", "must be a valid email"),
            ValidErr::new("age", "must be at least 18"),
        ]);
        assert_eq!(
            e.to_string(),
            "validation failed: email: must be a valid email, age: must be at least 18"
        );
    }

    #[test]
    fn test_execution_error_hides_sql_by_default() {
        let e: Error = ExecError::Query("boom".into()).into();
        assert_eq!(e.to_string(), "database error: query failed: boom");
        assert!(!e.is_client_error());

        let e = Error::Execution {
            source: ExecError::Query("boom".into()),
            sql: Some("SELECT 1".into()),
        };
        assert!(e.to_string().ends_with("(sql: SELECT 1)"));
    }
}
