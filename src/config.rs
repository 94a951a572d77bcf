//! Service configuration, loaded from JSON.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::rels::Overlay;
use crate::schema::{DBColumn, FKey};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate role: {0}")]
    DuplicateRole(String),
    #[error("role '{0}' needs a match expression when roles_query is set")]
    MissingMatch(String),
    #[error("roles_query is required when custom roles are defined")]
    MissingRolesQuery,
    #[error("unknown table '{table}' in {context}")]
    UnknownTable { table: String, context: String },
    #[error("invalid filter for {role}.{table}: {error}")]
    InvalidFilter {
        role: String,
        table: String,
        error: String,
    },
    #[error("invalid table config '{0}': {1}")]
    InvalidTable(String, String),
    #[error("invalid secret key: {0}")]
    InvalidSecret(String),
    #[error("db_max_conns must be at least 1")]
    InvalidPool,
}

fn default_limit() -> u32 {
    20
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_apq_size() -> usize {
    1000
}

fn default_max_conns() -> usize {
    16
}

fn default_pool_wait() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Only allow-listed queries may run
    pub production: bool,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    /// Block anonymous and custom roles on tables they have no config for
    #[serde(default = "default_true")]
    pub default_block: bool,
    pub disable_functions: bool,
    pub enable_camelcase: bool,
    pub blocklist: Vec<String>,
    #[serde(default = "default_schema")]
    pub db_schema: String,
    /// Seed for the cursor encryption key
    pub secret_key: Option<String>,
    #[serde(default = "default_apq_size")]
    pub apq_cache_size: usize,
    /// Most database connections open at once
    #[serde(default = "default_max_conns")]
    pub db_max_conns: usize,
    /// How long a request waits for a free connection, 0 waits forever
    #[serde(default = "default_pool_wait")]
    pub db_pool_wait_ms: u64,
    /// Statement selecting the row custom role `match` expressions run against
    pub roles_query: Option<String>,
    /// Attach generated SQL to responses and errors
    pub debug: bool,
    pub tables: Vec<TableConfig>,
    pub roles: Vec<RoleConfig>,
    /// Named values usable as `$name` in filters and presets. A `sql:`
    /// prefix marks raw SQL.
    pub vars: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            production: false,
            default_limit: default_limit(),
            default_block: true,
            disable_functions: false,
            enable_camelcase: false,
            blocklist: Vec::new(),
            db_schema: default_schema(),
            secret_key: None,
            apq_cache_size: default_apq_size(),
            db_max_conns: default_max_conns(),
            db_pool_wait_ms: default_pool_wait(),
            roles_query: None,
            debug: false,
            tables: Vec::new(),
            roles: Vec::new(),
            vars: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[default]
    Table,
    Json,
    Polymorphic,
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    /// Aliased table, or the table owning a json, polymorphic or remote field
    pub table: Option<String>,
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub columns: Vec<ColumnConfig>,
    pub type_column: Option<String>,
    pub id_column: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub primary: bool,
    pub array: bool,
    /// `table.column` or `schema.table.column`
    pub related_to: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub name: String,
    #[serde(rename = "match")]
    pub match_expr: Option<String>,
    pub tables: Vec<RoleTableConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTableConfig {
    pub name: String,
    pub read_only: bool,
    pub query: Option<QueryConfig>,
    pub insert: Option<MutationConfig>,
    pub update: Option<MutationConfig>,
    pub upsert: Option<MutationConfig>,
    pub delete: Option<MutationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub limit: u32,
    pub filters: Vec<String>,
    pub columns: Vec<String>,
    pub disable_functions: bool,
    pub block: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub filters: Vec<String>,
    pub columns: Vec<String>,
    pub presets: HashMap<String, String>,
    pub block: bool,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// True when roles are picked per request by running `roles_query`.
    pub fn abac_enabled(&self) -> bool {
        self.roles_query.is_some() && self.roles.iter().any(|r| !is_builtin_role(&r.name))
    }

    /// Checks that need no database: duplicate roles, missing `match`
    /// expressions and malformed table entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(ConfigError::InvalidSecret("secret_key is empty".into()));
        }
        if self.db_max_conns == 0 {
            return Err(ConfigError::InvalidPool);
        }

        let mut seen = HashSet::new();
        for r in &self.roles {
            if !seen.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateRole(r.name.clone()));
            }
            if is_builtin_role(&r.name) {
                continue;
            }
            if self.roles_query.is_none() {
                return Err(ConfigError::MissingRolesQuery);
            }
            if r.match_expr.as_deref().is_none_or(|m| m.trim().is_empty()) {
                return Err(ConfigError::MissingMatch(r.name.clone()));
            }
        }

        for t in &self.tables {
            if t.name.is_empty() {
                return Err(ConfigError::InvalidTable(String::new(), "missing name".into()));
            }
            match t.kind {
                TableKind::Polymorphic if t.type_column.is_none() || t.id_column.is_none() => {
                    return Err(ConfigError::InvalidTable(
                        t.name.clone(),
                        "polymorphic tables need type_column and id_column".into(),
                    ));
                }
                TableKind::Remote if t.id_column.is_none() => {
                    return Err(ConfigError::InvalidTable(
                        t.name.clone(),
                        "remote tables need id_column".into(),
                    ));
                }
                TableKind::Json | TableKind::Polymorphic | TableKind::Remote if t.table.is_none() => {
                    return Err(ConfigError::InvalidTable(
                        t.name.clone(),
                        "missing parent table".into(),
                    ));
                }
                _ => {}
            }
            for c in &t.columns {
                if let Some(rel) = &c.related_to {
                    parse_related_to(rel).ok_or_else(|| {
                        ConfigError::InvalidTable(
                            t.name.clone(),
                            format!("related_to must be table.column: {}", rel),
                        )
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Schema overlays described by the `tables` section.
    pub fn overlays(&self) -> Vec<Overlay> {
        let mut out = Vec::new();

        for t in &self.tables {
            let parent = t.table.clone().unwrap_or_default();
            match t.kind {
                TableKind::Table => {
                    if let Some(target) = &t.table {
                        out.push(Overlay::Alias {
                            name: t.name.clone(),
                            table: target.clone(),
                        });
                    }
                    for c in &t.columns {
                        out.push(Overlay::Column {
                            table: t.name.clone(),
                            column: column_from_config(c, &self.db_schema),
                        });
                    }
                }
                TableKind::Json => out.push(Overlay::Json {
                    name: t.name.clone(),
                    table: parent,
                    columns: t
                        .columns
                        .iter()
                        .map(|c| column_from_config(c, &self.db_schema))
                        .collect(),
                }),
                TableKind::Polymorphic => out.push(Overlay::Polymorphic {
                    name: t.name.clone(),
                    table: parent,
                    type_column: t.type_column.clone().unwrap_or_default(),
                    id_column: t.id_column.clone().unwrap_or_default(),
                }),
                TableKind::Remote => out.push(Overlay::Remote {
                    name: t.name.clone(),
                    table: parent,
                    id_column: t.id_column.clone().unwrap_or_default(),
                }),
            }
        }
        out
    }
}

pub fn is_builtin_role(name: &str) -> bool {
    name == "anon" || name == "user"
}

fn parse_related_to(s: &str) -> Option<(Option<&str>, &str, &str)> {
    let parts: Vec<&str> = s.split('.').collect();
    match parts.as_slice() {
        [t, c] if !t.is_empty() && !c.is_empty() => Some((None, t, c)),
        [s, t, c] if !t.is_empty() && !c.is_empty() => Some((Some(s), t, c)),
        _ => None,
    }
}

fn column_from_config(c: &ColumnConfig, schema: &str) -> DBColumn {
    let typ = if c.typ.is_empty() { "text" } else { &c.typ };
    let mut col = DBColumn::new(&c.name, &typ.to_lowercase());
    col.primary_key = c.primary;
    col.array = c.array;
    col.fk = c
        .related_to
        .as_deref()
        .and_then(parse_related_to)
        .map(|(s, t, fc)| FKey {
            schema: s.unwrap_or(schema).to_string(),
            table: t.to_string(),
            col: fc.to_string(),
        });
    col
}
