//! Normalize DDL column types to the names the database catalog reports,
//! so types loaded from a dump can be used in casts just like discovered
//! ones.

use super::Dialect;

/// Map a DDL type to its catalog name. Returns the type and whether it
/// is an array.
pub fn map_type(sql_type: &str, dialect: Dialect) -> (String, bool) {
    let lower = sql_type.trim().to_lowercase();
    let (lower, array) = match lower.strip_suffix("[]") {
        Some(inner) => (inner.trim().to_string(), true),
        None => (lower, false),
    };
    let base = lower.split('(').next().unwrap_or(&lower).trim();

    let typ = match dialect {
        Dialect::MySQL => map_mysql_type(base, &lower),
        _ => map_postgres_type(base),
    };
    (typ, array)
}

fn map_postgres_type(base: &str) -> String {
    let typ = match base {
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer",
        "bigint" | "int8" | "bigserial" | "serial8" => "bigint",
        "smallint" | "int2" | "smallserial" | "serial2" => "smallint",

        "real" | "float4" => "real",
        "double precision" | "float8" | "float" | "double" => "double precision",
        "decimal" | "numeric" => "numeric",

        "varchar" | "character varying" => "character varying",
        "char" | "character" | "bpchar" => "character",
        "text" | "citext" => "text",

        "timestamp" | "timestamp without time zone" | "datetime" => "timestamp without time zone",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        "time" | "time without time zone" => "time without time zone",
        "timetz" | "time with time zone" => "time with time zone",

        "boolean" | "bool" => "boolean",
        "bytea" | "blob" => "bytea",
        _ => return base.to_string(),
    };
    typ.to_string()
}

fn map_mysql_type(base: &str, full: &str) -> String {
    let typ = match base {
        "int" | "integer" | "mediumint" => "int",
        "bigint" | "serial" => "bigint",
        "smallint" => "smallint",
        // TINYINT(1) is the MySQL boolean
        "tinyint" if full.contains("tinyint(1)") => "tinyint(1)",
        "tinyint" => "tinyint",
        "bool" | "boolean" => "tinyint(1)",

        "float" | "real" => "float",
        "double" | "double precision" => "double",
        "decimal" | "numeric" => "decimal",

        "varchar" | "character varying" => "varchar",
        "char" | "character" => "char",
        "text" | "longtext" | "mediumtext" | "tinytext" => "text",

        "datetime" => "datetime",
        "timestamp" => "timestamp",
        "blob" | "longblob" | "mediumblob" | "tinyblob" => "blob",
        _ => return base.to_string(),
    };
    typ.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_types() {
        assert_eq!(map_type("SERIAL", Dialect::PostgreSQL), ("integer".into(), false));
        assert_eq!(
            map_type("VARCHAR(255)", Dialect::PostgreSQL),
            ("character varying".into(), false)
        );
        assert_eq!(
            map_type("TIMESTAMPTZ", Dialect::PostgreSQL),
            ("timestamp with time zone".into(), false)
        );
        assert_eq!(map_type("JSONB", Dialect::PostgreSQL), ("jsonb".into(), false));
        assert_eq!(map_type("text[]", Dialect::PostgreSQL), ("text".into(), true));
        assert_eq!(map_type("NUMERIC(7,2)", Dialect::PostgreSQL), ("numeric".into(), false));
    }

    #[test]
    fn test_mysql_types() {
        assert_eq!(map_type("INT", Dialect::MySQL).0, "int");
        assert_eq!(map_type("TINYINT(1)", Dialect::MySQL).0, "tinyint(1)");
        assert_eq!(map_type("TINYINT(4)", Dialect::MySQL).0, "tinyint");
        assert_eq!(map_type("LONGTEXT", Dialect::MySQL).0, "text");
    }
}
