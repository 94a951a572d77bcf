//! Database schema model.
//!
//! A `DBInfo` is a plain snapshot of what was discovered in the database
//! catalog (or loaded from a dump or schema file). The relationship graph
//! built on top of it lives in [`rels`].

pub mod describe;
pub mod discover;
pub mod rels;

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use rels::{DBRel, DBSchema, PolyInfo, RelEnd, RelType, Through};

/// Tables with this prefix are bookkeeping tables and never exposed.
pub const INTERNAL_PREFIX: &str = "_gs_";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("column '{0}.{1}' not found")]
    ColumnNotFound(String, String),
    #[error("foreign key table not found: {0}.{1}")]
    FkTableNotFound(String, String),
    #[error("foreign key column not found: {0}.{1}")]
    FkColumnNotFound(String, String),
    #[error("no relationship found between '{0}' and '{1}'")]
    RelNotFound(String, String),
    #[error("ambiguous relationship between '{0}' and '{1}', use @through to pick one of: {2}")]
    AmbiguousRel(String, String, String),
    #[error("invalid blocklist pattern '{0}': {1}")]
    InvalidBlocklist(String, String),
    #[error("invalid table config '{0}': {1}")]
    InvalidTable(String, String),
    #[error("invalid schema file: {0}")]
    Describe(String),
    #[error("schema discovery failed: {0}")]
    Discover(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    #[default]
    Table,
    View,
    Json,
    Virtual,
}

impl TableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::Table => "table",
            TableType::View => "view",
            TableType::Json => "json",
            TableType::Virtual => "virtual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FKey {
    pub schema: String,
    pub table: String,
    pub col: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DBColumn {
    pub id: usize,
    pub name: String,
    /// Lowercased name used for lookups.
    pub key: String,
    pub typ: String,
    pub array: bool,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique_key: bool,
    pub full_text: bool,
    pub fk: Option<FKey>,
    pub blocked: bool,
    pub table: String,
    pub schema: String,
}

impl DBColumn {
    pub fn new(name: &str, typ: &str) -> Self {
        Self {
            name: name.to_string(),
            key: name.to_lowercase(),
            typ: typ.to_string(),
            ..Default::default()
        }
    }

    /// True when the foreign key points back at the owning table.
    pub fn fk_recursive(&self) -> bool {
        self.fk
            .as_ref()
            .is_some_and(|fk| fk.schema == self.schema && fk.table == self.table)
    }
}

impl fmt::Display for DBColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}:{}:{}{}{}{}{}{}",
            self.schema,
            self.table,
            self.name,
            self.typ,
            if self.array { "a" } else { "-" },
            if self.not_null { "n" } else { "-" },
            if self.primary_key { "p" } else { "-" },
            if self.unique_key { "u" } else { "-" },
            if self.full_text { "f" } else { "-" },
            if self.blocked { "b" } else { "-" },
        )?;
        if let Some(fk) = &self.fk {
            write!(f, ">{}.{}.{}", fk.schema, fk.table, fk.col)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBFuncParam {
    pub id: usize,
    pub name: String,
    pub typ: String,
    pub array: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBFunction {
    pub schema: String,
    pub name: String,
    /// Return type
    pub typ: String,
    pub agg: bool,
    pub inputs: Vec<DBFuncParam>,
}

impl fmt::Display for DBFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .inputs
            .iter()
            .map(|p| format!("{}:{}{}", p.name, p.typ, if p.array { "[]" } else { "" }))
            .collect();
        write!(
            f,
            "{}.{}({}):{}{}",
            self.schema,
            self.name,
            params.join(","),
            self.typ,
            if self.agg { ":agg" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DBTable {
    pub schema: String,
    pub name: String,
    pub typ: TableType,
    pub columns: Vec<DBColumn>,
    pub blocked: bool,
    col_map: HashMap<String, usize>,
}

impl DBTable {
    pub fn new(schema: &str, name: &str, typ: TableType, mut columns: Vec<DBColumn>) -> Self {
        let mut col_map = HashMap::with_capacity(columns.len());
        for (i, c) in columns.iter_mut().enumerate() {
            c.id = i;
            c.schema = schema.to_string();
            c.table = name.to_string();
            if c.key.is_empty() {
                c.key = c.name.to_lowercase();
            }
            if c.primary_key {
                c.unique_key = true;
            }
            col_map.insert(c.key.clone(), i);
        }
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            typ,
            columns,
            blocked: false,
            col_map,
        }
    }

    pub fn column(&self, name: &str) -> Option<&DBColumn> {
        self.col_map
            .get(name)
            .or_else(|| self.col_map.get(&name.to_lowercase()))
            .map(|&i| &self.columns[i])
    }

    pub fn get_column(&self, name: &str) -> Result<&DBColumn, SchemaError> {
        self.column(name)
            .ok_or_else(|| SchemaError::ColumnNotFound(self.name.clone(), name.to_string()))
    }

    pub fn primary(&self) -> Option<&DBColumn> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn full_text(&self) -> impl Iterator<Item = &DBColumn> {
        self.columns.iter().filter(|c| c.full_text)
    }
}

/// Compiled table and column blocklist. Patterns match whole names.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    patterns: Vec<Regex>,
}

impl Blocklist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, SchemaError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("^{}$", p))
                    .map_err(|e| SchemaError::InvalidBlocklist(p.to_string(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// Snapshot of the database catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct DBInfo {
    pub typ: String,
    pub version: u32,
    pub schema: String,
    pub name: String,
    pub tables: Vec<DBTable>,
    pub functions: Vec<DBFunction>,
    table_map: HashMap<String, usize>,
    hash: u64,
}

impl DBInfo {
    pub fn new(
        typ: &str,
        version: u32,
        schema: &str,
        name: &str,
        tables: Vec<DBTable>,
        functions: Vec<DBFunction>,
        blocklist: &Blocklist,
    ) -> Self {
        let mut di = Self {
            typ: typ.to_string(),
            version,
            schema: schema.to_string(),
            name: name.to_string(),
            tables: Vec::with_capacity(tables.len()),
            functions: functions
                .into_iter()
                .filter(|f| !blocklist.is_blocked(&f.name))
                .collect(),
            table_map: HashMap::new(),
            hash: 0,
        };

        for mut t in tables {
            if t.name.starts_with(INTERNAL_PREFIX) {
                continue;
            }
            t.blocked |= blocklist.is_blocked(&t.name);
            for c in &mut t.columns {
                c.blocked |= blocklist.is_blocked(&c.name);
            }
            di.add_table(t);
        }

        di.hash = di.compute_hash();
        di
    }

    fn add_table(&mut self, t: DBTable) {
        let i = self.tables.len();
        self.table_map.insert(format!("{}.{}", t.schema, t.name), i);
        self.tables.push(t);
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&DBTable> {
        self.table_map
            .get(&format!("{}.{}", schema, name))
            .map(|&i| &self.tables[i])
    }

    pub fn get_table(&self, schema: &str, name: &str) -> Result<&DBTable, SchemaError> {
        self.table(schema, name)
            .ok_or_else(|| SchemaError::TableNotFound(format!("{}.{}", schema, name)))
    }

    /// Structural hash over the catalog. Independent of table, column and
    /// function order so a snapshot read back from a schema file hashes
    /// the same as the one it was written from.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    fn compute_hash(&self) -> u64 {
        let mut lines: Vec<String> = Vec::new();
        for t in &self.tables {
            lines.push(format!(
                "t:{}.{}:{}:{}",
                t.schema,
                t.name,
                t.typ.as_str(),
                t.blocked
            ));
            lines.extend(t.columns.iter().map(|c| format!("c:{}", c)));
        }
        lines.extend(self.functions.iter().map(|f| format!("f:{}", f)));
        lines.sort();

        let mut h = Sha256::new();
        h.update(format!("{}:{}:{}", self.typ, self.version, self.schema));
        for l in &lines {
            h.update(b"\n");
            h.update(l.as_bytes());
        }
        let digest = h.finalize();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(buf)
    }
}

/// Naive English singular form used to register `user` next to `users`.
pub fn singular(s: &str) -> String {
    let lower = s.to_lowercase();
    if lower.ends_with("ies") && s.len() > 3 {
        return format!("{}y", &s[..s.len() - 3]);
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if lower.ends_with(suffix) {
            return s[..s.len() - 2].to_string();
        }
    }
    if lower.ends_with("ss") || lower.ends_with("us") || lower.ends_with("is") {
        return s.to_string();
    }
    if lower.ends_with('s') && s.len() > 1 {
        return s[..s.len() - 1].to_string();
    }
    s.to_string()
}

pub fn plural(s: &str) -> String {
    let lower = s.to_lowercase();
    if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
        && !lower.ends_with("oy")
        && !lower.ends_with("uy")
    {
        return format!("{}ies", &s[..s.len() - 1]);
    }
    for suffix in ["s", "sh", "ch", "x", "z"] {
        if lower.ends_with(suffix) {
            return format!("{}es", s);
        }
    }
    format!("{}s", s)
}

/// `createdAt` -> `created_at`
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `created_at` -> `createdAt`
pub fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper = false;
    for c in s.chars() {
        if c == '_' && !out.is_empty() {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, typ: &str) -> DBColumn {
        DBColumn::new(name, typ)
    }

    #[test]
    fn test_singular_plural() {
        assert_eq!(singular("users"), "user");
        assert_eq!(singular("categories"), "category");
        assert_eq!(singular("addresses"), "address");
        assert_eq!(singular("status"), "status");
        assert_eq!(plural("user"), "users");
        assert_eq!(plural("category"), "categories");
        assert_eq!(plural("box"), "boxes");
        assert_eq!(plural("day"), "days");
    }

    #[test]
    fn test_case_conversion() {
        assert_eq!(to_snake_case("createdAt"), "created_at");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_camel_case("created_at"), "createdAt");
        assert_eq!(to_camel_case("_private"), "_private");
    }

    #[test]
    fn test_blocklist() {
        let bl = Blocklist::new(&["password", "secret_.*"]).unwrap();
        assert!(bl.is_blocked("password"));
        assert!(bl.is_blocked("secret_key"));
        assert!(!bl.is_blocked("password_hint"));
        assert!(Blocklist::new(&["("]).is_err());
    }

    #[test]
    fn test_dbinfo_blocks_and_skips_internal() {
        let mut pw = col("password", "text");
        pw.not_null = true;
        let users = DBTable::new("public", "users", TableType::Table, vec![col("id", "bigint"), pw]);
        let internal = DBTable::new("public", "_gs_migrations", TableType::Table, vec![col("id", "int")]);
        let bl = Blocklist::new(&["password"]).unwrap();

        let di = DBInfo::new("postgres", 150000, "public", "db", vec![users, internal], vec![], &bl);
        assert_eq!(di.tables.len(), 1);

        let t = di.get_table("public", "users").unwrap();
        assert!(t.get_column("password").unwrap().blocked);
        assert!(!t.get_column("id").unwrap().blocked);
        assert!(di.get_table("public", "_gs_migrations").is_err());
    }

    #[test]
    fn test_hash_ignores_order() {
        let a = DBTable::new("public", "a", TableType::Table, vec![col("id", "int"), col("x", "text")]);
        let b = DBTable::new("public", "b", TableType::Table, vec![col("id", "int")]);
        let a2 = DBTable::new("public", "a", TableType::Table, vec![col("x", "text"), col("id", "int")]);

        let bl = Blocklist::default();
        let d1 = DBInfo::new("postgres", 1, "public", "db", vec![a, b.clone()], vec![], &bl);
        let d2 = DBInfo::new("postgres", 1, "public", "db", vec![b, a2], vec![], &bl);
        assert_eq!(d1.hash(), d2.hash());

        let c = DBTable::new("public", "a", TableType::Table, vec![col("id", "bigint")]);
        let d3 = DBInfo::new("postgres", 1, "public", "db", vec![c], vec![], &bl);
        assert_ne!(d1.hash(), d3.hash());
    }

    #[test]
    fn test_primary_key_implies_unique() {
        let mut id = col("id", "int");
        id.primary_key = true;
        let t = DBTable::new("public", "t", TableType::Table, vec![id]);
        assert!(t.primary().unwrap().unique_key);
        assert_eq!(t.column("ID").unwrap().name, "id");
    }
}
