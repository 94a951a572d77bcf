//! Catalog discovery against a live database.
//!
//! Every catalog query is wrapped so the database returns a single JSON
//! array which is then decoded with serde.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use super::{Blocklist, DBColumn, DBFuncParam, DBFunction, DBInfo, DBTable, FKey, SchemaError, TableType};
use crate::error::Error;
use crate::exec::Database;

const PG_INFO: &str = r#"
SELECT json_build_object(
    'version', CAST(current_setting('server_version_num') AS integer),
    'schema', current_schema(),
    'name', current_database())"#;

const PG_COLUMNS: &str = r#"
SELECT coalesce(json_agg(t), '[]') FROM (
SELECT
    n.nspname AS "schema",
    c.relname AS "table",
    (CASE WHEN c.relkind IN ('v', 'm') THEN 'view' ELSE 'table' END) AS "kind",
    f.attname AS "name",
    pg_catalog.format_type(f.atttypid, f.atttypmod) AS "type",
    f.attnotnull AS "not_null",
    coalesce(co.contype = 'p', false) AS "primary_key",
    coalesce(co.contype = 'u', false) AS "unique_key",
    (f.attndims != 0 OR right(pg_catalog.format_type(f.atttypid, f.atttypmod), 2) = '[]') AS "array",
    (pg_catalog.format_type(f.atttypid, f.atttypmod) = 'tsvector') AS "full_text",
    (CASE WHEN co.contype = 'f'
        THEN (SELECT fn.nspname FROM pg_class fc JOIN pg_namespace fn ON fn.oid = fc.relnamespace WHERE fc.oid = co.confrelid)
        ELSE '' END) AS "fk_schema",
    (CASE WHEN co.contype = 'f'
        THEN (SELECT relname FROM pg_class WHERE oid = co.confrelid)::text
        ELSE '' END) AS "fk_table",
    (CASE WHEN co.contype = 'f'
        THEN (SELECT fa.attname FROM pg_attribute fa WHERE fa.attnum = co.confkey[1] AND fa.attrelid = co.confrelid)::text
        ELSE '' END) AS "fk_col"
FROM pg_attribute f
    JOIN pg_class c ON c.oid = f.attrelid
    LEFT JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_constraint co ON co.conrelid = c.oid AND f.attnum = ANY (co.conkey)
WHERE c.relkind IN ('r', 'v', 'm', 'f', 'p')
    AND n.nspname NOT IN ('information_schema', 'pg_catalog', 'pg_toast')
    AND f.attnum > 0
    AND f.attisdropped = false
ORDER BY n.nspname, c.relname, f.attnum) t"#;

const PG_FUNCTIONS: &str = r#"
SELECT coalesce(json_agg(t), '[]') FROM (
SELECT
    r.specific_name AS "id",
    r.routine_schema AS "schema",
    r.routine_name AS "name",
    r.data_type AS "type",
    p.ordinal_position AS "param_id",
    coalesce(p.parameter_name, '') AS "param_name",
    p.data_type AS "param_type",
    p.parameter_mode AS "param_mode"
FROM information_schema.routines r
    JOIN information_schema.parameters p
    ON p.specific_schema = r.specific_schema AND p.specific_name = r.specific_name
WHERE r.routine_schema NOT IN ('information_schema', 'pg_catalog')
    AND r.routine_type = 'FUNCTION'
ORDER BY r.specific_name, p.ordinal_position) t"#;

const MYSQL_INFO: &str = r#"
SELECT JSON_OBJECT(
    'version', CONVERT(REPLACE(SUBSTRING_INDEX(VERSION(), '-', 1), '.', ''), SIGNED INTEGER),
    'schema', DATABASE(),
    'name', DATABASE())"#;

const MYSQL_COLUMNS: &str = r#"
SELECT coalesce(JSON_ARRAYAGG(JSON_OBJECT(
    'schema', t.table_schema, 'table', t.table_name, 'kind', t.kind, 'name', t.column_name,
    'type', t.data_type, 'not_null', t.not_null = 1, 'primary_key', t.primary_key = 1,
    'unique_key', t.unique_key = 1, 'array', false, 'full_text', t.full_text = 1,
    'fk_schema', t.fk_schema, 'fk_table', t.fk_table, 'fk_col', t.fk_col)), JSON_ARRAY())
FROM (
SELECT col.table_schema, col.table_name,
    (CASE WHEN tb.table_type = 'VIEW' THEN 'view' ELSE 'table' END) AS kind,
    col.column_name, col.data_type,
    (col.is_nullable = 'NO') AS not_null,
    (col.column_key = 'PRI') AS primary_key,
    (col.column_key = 'UNI') AS unique_key,
    EXISTS (SELECT 1 FROM information_schema.statistics st
        WHERE st.table_schema = col.table_schema AND st.table_name = col.table_name
        AND st.column_name = col.column_name AND st.index_type = 'FULLTEXT') AS full_text,
    coalesce(kcu.referenced_table_schema, '') AS fk_schema,
    coalesce(kcu.referenced_table_name, '') AS fk_table,
    coalesce(kcu.referenced_column_name, '') AS fk_col
FROM information_schema.columns col
    JOIN information_schema.tables tb
    ON tb.table_schema = col.table_schema AND tb.table_name = col.table_name
    LEFT JOIN information_schema.key_column_usage kcu
    ON kcu.table_schema = col.table_schema AND kcu.table_name = col.table_name
    AND kcu.column_name = col.column_name AND kcu.referenced_table_name IS NOT NULL
WHERE col.table_schema = DATABASE()
ORDER BY col.table_name, col.ordinal_position) t"#;

const MYSQL_FUNCTIONS: &str = r#"
SELECT coalesce(JSON_ARRAYAGG(JSON_OBJECT(
    'id', r.specific_name, 'schema', r.routine_schema, 'name', r.routine_name,
    'type', r.data_type, 'param_id', p.ordinal_position,
    'param_name', coalesce(p.parameter_name, ''), 'param_type', p.data_type,
    'param_mode', p.parameter_mode)), JSON_ARRAY())
FROM information_schema.routines r
    JOIN information_schema.parameters p
    ON p.specific_schema = r.specific_schema AND p.specific_name = r.specific_name
WHERE r.routine_schema = DATABASE() AND r.routine_type = 'FUNCTION'"#;

#[derive(Debug, Deserialize)]
struct InfoRow {
    version: u32,
    schema: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnRow {
    schema: String,
    table: String,
    kind: String,
    name: String,
    #[serde(rename = "type")]
    typ: String,
    not_null: bool,
    primary_key: bool,
    unique_key: bool,
    array: bool,
    full_text: bool,
    #[serde(default)]
    fk_schema: String,
    #[serde(default)]
    fk_table: String,
    #[serde(default)]
    fk_col: String,
}

#[derive(Debug, Deserialize)]
struct FunctionRow {
    id: String,
    schema: String,
    name: String,
    #[serde(rename = "type")]
    typ: Option<String>,
    param_id: usize,
    param_name: String,
    param_type: String,
    param_mode: Option<String>,
}

/// Catalog statements for a database type.
pub struct Catalog {
    pub info: &'static str,
    pub columns: &'static str,
    pub functions: &'static str,
}

pub fn catalog(db_type: &str) -> Catalog {
    match db_type {
        "mysql" => Catalog {
            info: MYSQL_INFO,
            columns: MYSQL_COLUMNS,
            functions: MYSQL_FUNCTIONS,
        },
        _ => Catalog {
            info: PG_INFO,
            columns: PG_COLUMNS,
            functions: PG_FUNCTIONS,
        },
    }
}

/// Read tables, columns and functions from the database catalog.
pub async fn discover(
    db: &dyn Database,
    db_type: &str,
    blocklist: &Blocklist,
) -> Result<DBInfo, Error> {
    let cat = catalog(db_type);

    let (info, cols, funcs) = futures::try_join!(
        db.query_json(cat.info, &[]),
        db.query_json(cat.columns, &[]),
        db.query_json(cat.functions, &[]),
    )?;

    let info: InfoRow = decode(info)?;
    let cols: Vec<ColumnRow> = decode(cols)?;
    let funcs: Vec<FunctionRow> = decode(funcs)?;

    debug!(
        db_type,
        columns = cols.len(),
        functions = funcs.len(),
        "discovered catalog"
    );

    Ok(DBInfo::new(
        db_type,
        info.version,
        &info.schema,
        &info.name,
        build_tables(cols),
        build_functions(funcs),
        blocklist,
    ))
}

fn decode<T: serde::de::DeserializeOwned>(v: Option<serde_json::Value>) -> Result<T, Error> {
    let v = v.ok_or_else(|| SchemaError::Discover("catalog query returned no rows".into()))?;
    serde_json::from_value(v)
        .map_err(|e| SchemaError::Discover(format!("bad catalog row: {}", e)).into())
}

/// A column shows up once per constraint it takes part in. Merge those
/// rows and group columns by table keeping catalog order.
fn build_tables(rows: Vec<ColumnRow>) -> Vec<DBTable> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut tables: HashMap<(String, String), Vec<DBColumn>> = HashMap::new();

    for r in rows {
        let key = (r.schema.clone(), r.table.clone());
        let cols = tables.entry(key).or_insert_with(|| {
            order.push((r.schema.clone(), r.table.clone(), r.kind.clone()));
            Vec::new()
        });

        let typ = r.typ.trim_end_matches("[]").to_string();
        let idx = match cols.iter().position(|c| c.name == r.name) {
            Some(i) => i,
            None => {
                cols.push(DBColumn::new(&r.name, &typ));
                cols.len() - 1
            }
        };
        let c = &mut cols[idx];

        if !typ.is_empty() {
            c.typ = typ;
        }
        c.not_null |= r.not_null;
        c.primary_key |= r.primary_key;
        c.unique_key |= r.unique_key || r.primary_key;
        c.array |= r.array;
        c.full_text |= r.full_text;
        if !r.fk_table.is_empty() {
            c.fk = Some(FKey {
                schema: r.fk_schema,
                table: r.fk_table,
                col: r.fk_col,
            });
        }
    }

    order
        .into_iter()
        .filter_map(|(schema, name, kind)| {
            let cols = tables.remove(&(schema.clone(), name.clone()))?;
            let typ = if kind == "view" {
                TableType::View
            } else {
                TableType::Table
            };
            Some(DBTable::new(&schema, &name, typ, cols))
        })
        .collect()
}

fn build_functions(rows: Vec<FunctionRow>) -> Vec<DBFunction> {
    let mut funcs: Vec<DBFunction> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for r in rows {
        let i = *index.entry(r.id.clone()).or_insert_with(|| {
            funcs.push(DBFunction {
                schema: r.schema.clone(),
                name: r.name.clone(),
                typ: r.typ.clone().unwrap_or_default().to_lowercase(),
                agg: false,
                inputs: Vec::new(),
            });
            funcs.len() - 1
        });

        let mode = r.param_mode.as_deref().unwrap_or("IN");
        if !mode.eq_ignore_ascii_case("in") {
            continue;
        }

        let array = r.param_type.ends_with("[]") || r.param_type.eq_ignore_ascii_case("array");
        let name = if r.param_name.is_empty() {
            format!("arg{}", r.param_id)
        } else {
            r.param_name
        };
        let f = &mut funcs[i];
        f.inputs.push(DBFuncParam {
            id: f.inputs.len(),
            name,
            typ: r.param_type.trim_end_matches("[]").to_lowercase(),
            array,
        });
    }
    funcs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::FakeDb;
    use serde_json::json;

    fn row(table: &str, name: &str, typ: &str) -> serde_json::Value {
        json!({
            "schema": "public", "table": table, "kind": "table", "name": name, "type": typ,
            "not_null": false, "primary_key": false, "unique_key": false,
            "array": false, "full_text": false,
            "fk_schema": "", "fk_table": "", "fk_col": ""
        })
    }

    #[tokio::test]
    async fn test_discover_merges_constraint_rows() {
        let mut id_pk = row("users", "id", "bigint");
        id_pk["primary_key"] = json!(true);
        let mut owner_fk = row("products", "owner_id", "bigint");
        owner_fk["fk_schema"] = json!("public");
        owner_fk["fk_table"] = json!("users");
        owner_fk["fk_col"] = json!("id");
        let mut tags = row("products", "tags", "text[]");
        tags["array"] = json!(true);

        let db = FakeDb::new(vec![
            json!({"version": 150000, "schema": "public", "name": "app"}),
            json!([
                row("users", "id", "bigint"),
                id_pk,
                row("users", "password", "text"),
                row("products", "owner_id", "bigint"),
                owner_fk,
                tags,
            ]),
            json!([
                {"id": "f_1", "schema": "public", "name": "add_five", "type": "integer",
                 "param_id": 1, "param_name": "", "param_type": "integer", "param_mode": "IN"}
            ]),
        ]);

        let bl = Blocklist::new(&["password"]).unwrap();
        let info = discover(&db, "postgres", &bl).await.unwrap();

        assert_eq!(info.version, 150000);
        assert_eq!(info.name, "app");
        assert_eq!(info.tables.len(), 2);

        let users = info.get_table("public", "users").unwrap();
        assert_eq!(users.columns.len(), 2);
        assert!(users.get_column("id").unwrap().primary_key);
        assert!(users.get_column("password").unwrap().blocked);

        let products = info.get_table("public", "products").unwrap();
        let owner = products.get_column("owner_id").unwrap();
        assert_eq!(owner.fk.as_ref().unwrap().table, "users");
        let tags = products.get_column("tags").unwrap();
        assert!(tags.array);
        assert_eq!(tags.typ, "text");

        assert_eq!(info.functions[0].inputs[0].name, "arg1");
    }

    #[tokio::test]
    async fn test_discover_bad_rows() {
        let db = FakeDb::new(vec![json!({"version": "x"}), json!([]), json!([])]);
        assert!(discover(&db, "postgres", &Blocklist::default()).await.is_err());
    }
}
