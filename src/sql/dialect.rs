//! SQL dialect detection and dialect specific spelling.

/// SQL dialect variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Auto-detect from dump content
    #[default]
    Auto,
    /// Standard SQL, rendered like PostgreSQL
    Generic,
    /// PostgreSQL
    PostgreSQL,
    /// MySQL
    MySQL,
}

impl Dialect {
    /// Parse dialect from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "generic" => Some(Self::Generic),
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            _ => None,
        }
    }

    /// Dialect for a `DBInfo::typ` value.
    pub fn from_db_type(typ: &str) -> Self {
        match typ {
            "mysql" => Self::MySQL,
            _ => Self::PostgreSQL,
        }
    }

    /// Value stored in `DBInfo::typ`.
    pub fn db_type(self) -> &'static str {
        match self {
            Self::MySQL => "mysql",
            _ => "postgres",
        }
    }

    pub fn is_mysql(self) -> bool {
        self == Self::MySQL
    }

    /// Detect dialect from SQL content.
    pub fn detect(content: &str) -> Self {
        let lower = content.to_lowercase();

        if lower.contains("postgresql database dump")
            || lower.contains("pg_dump")
            || lower.contains("-- postgres")
        {
            return Self::PostgreSQL;
        }
        if lower.contains("mysql dump") || lower.contains("mysqldump") || lower.contains("-- mysql")
        {
            return Self::MySQL;
        }

        if lower.contains("serial")
            || lower.contains("[]")
            || lower.contains("jsonb")
            || lower.contains("timestamptz")
            || lower.contains("tsvector")
        {
            return Self::PostgreSQL;
        }
        if lower.contains("auto_increment")
            || lower.contains("engine=")
            || lower.contains("unsigned")
            || lower.contains("fulltext")
        {
            return Self::MySQL;
        }

        Self::Generic
    }

    /// Resolve Auto to a concrete dialect.
    pub fn resolve(self, content: &str) -> Self {
        match self {
            Self::Auto => Self::detect(content),
            other => other,
        }
    }

    /// Quote an identifier: `"users"` or `` `users` ``.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::MySQL => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Bind parameter placeholder for the nth (1 based) parameter.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::MySQL => "?".to_string(),
            _ => format!("${}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_postgres() {
        let sql = "-- PostgreSQL database dump\nCREATE TABLE users (id SERIAL);";
        assert_eq!(Dialect::detect(sql), Dialect::PostgreSQL);
        assert_eq!(Dialect::detect("CREATE TABLE t (tags text[]);"), Dialect::PostgreSQL);
    }

    #[test]
    fn test_detect_mysql() {
        let sql = "-- MySQL dump\nCREATE TABLE users (id INT AUTO_INCREMENT);";
        assert_eq!(Dialect::detect(sql), Dialect::MySQL);
    }

    #[test]
    fn test_detect_generic() {
        let sql = "CREATE TABLE users (id INTEGER PRIMARY KEY);";
        assert_eq!(Dialect::detect(sql), Dialect::Generic);
        assert_eq!(Dialect::Generic.db_type(), "postgres");
    }

    #[test]
    fn test_quote() {
        assert_eq!(Dialect::PostgreSQL.quote("users"), "\"users\"");
        assert_eq!(Dialect::PostgreSQL.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::MySQL.quote("users"), "`users`");
        assert_eq!(Dialect::PostgreSQL.placeholder(3), "$3");
        assert_eq!(Dialect::MySQL.placeholder(3), "?");
    }
}
