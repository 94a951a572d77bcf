//! Roles and the per table permission index.
//!
//! `anon` and `user` always exist. Custom roles come from configuration,
//! are numbered in declaration order and checked once when the registry
//! is built.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::ast::Node;
use crate::config::{Config, ConfigError, MutationConfig, QueryConfig};
use crate::parser::parse_value;
use crate::schema::DBSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Anon,
    User,
    Custom(usize),
}

impl Role {
    pub fn is_anon(self) -> bool {
        self == Role::Anon
    }
}

/// Value written into a column on insert or update regardless of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Preset {
    /// `sql:now()`
    Sql(String),
    /// `$user_id`
    Var(String),
    Value(String),
}

impl Preset {
    pub fn parse(s: &str) -> Self {
        if let Some(sql) = s.strip_prefix("sql:") {
            Preset::Sql(sql.trim().to_string())
        } else if let Some(v) = s.strip_prefix('$') {
            Preset::Var(v.to_string())
        } else {
            Preset::Value(s.to_string())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPerms {
    pub limit: Option<u32>,
    pub filters: Vec<Node>,
    /// Empty means every column
    pub columns: HashSet<String>,
    pub disable_functions: bool,
    pub block: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MutationPerms {
    pub filters: Vec<Node>,
    pub columns: HashSet<String>,
    pub presets: Vec<(String, Preset)>,
    pub block: bool,
}

impl MutationPerms {
    pub fn allows(&self, col: &str) -> bool {
        self.columns.is_empty() || self.columns.contains(col)
    }
}

impl QueryPerms {
    pub fn allows(&self, col: &str) -> bool {
        self.columns.is_empty() || self.columns.contains(col)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TablePerms {
    pub query: Option<QueryPerms>,
    pub insert: Option<MutationPerms>,
    pub update: Option<MutationPerms>,
    pub upsert: Option<MutationPerms>,
    pub delete: Option<MutationPerms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Upsert => "upsert",
            MutationKind::Delete => "delete",
        })
    }
}

impl TablePerms {
    pub fn mutation(&self, kind: MutationKind) -> Option<&MutationPerms> {
        match kind {
            MutationKind::Insert => self.insert.as_ref(),
            MutationKind::Update => self.update.as_ref(),
            MutationKind::Upsert => self.upsert.as_ref(),
            MutationKind::Delete => self.delete.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    custom: Vec<(String, String)>,
    perms: HashMap<(Role, String), TablePerms>,
    default_block: bool,
}

impl RoleRegistry {
    pub fn new(conf: &Config, schema: &DBSchema) -> Result<Self, ConfigError> {
        let mut reg = Self {
            custom: Vec::new(),
            perms: HashMap::new(),
            default_block: conf.default_block,
        };

        for rc in &conf.roles {
            let role = match rc.name.as_str() {
                "anon" => Role::Anon,
                "user" => Role::User,
                name => {
                    if reg.custom.iter().any(|(n, _)| n == name) {
                        return Err(ConfigError::DuplicateRole(name.to_string()));
                    }
                    reg.custom
                        .push((name.to_string(), rc.match_expr.clone().unwrap_or_default()));
                    Role::Custom(reg.custom.len() - 1)
                }
            };

            for tc in &rc.tables {
                let tr = schema.find(&tc.name).ok_or_else(|| ConfigError::UnknownTable {
                    table: tc.name.clone(),
                    context: format!("role '{}'", rc.name),
                })?;
                let table = schema.table(tr.id).name.clone();
                let ctx = |error: String| ConfigError::InvalidFilter {
                    role: rc.name.clone(),
                    table: tc.name.clone(),
                    error,
                };

                let mut tp = TablePerms {
                    query: tc.query.as_ref().map(|q| query_perms(q, &ctx)).transpose()?,
                    ..Default::default()
                };
                if !tc.read_only {
                    tp.insert = mutation_perms(tc.insert.as_ref(), &ctx)?;
                    tp.update = mutation_perms(tc.update.as_ref(), &ctx)?;
                    tp.upsert = mutation_perms(tc.upsert.as_ref(), &ctx)?;
                    tp.delete = mutation_perms(tc.delete.as_ref(), &ctx)?;
                }
                reg.perms.insert((role, table), tp);
            }
        }
        Ok(reg)
    }

    pub fn resolve(&self, name: &str) -> Option<Role> {
        match name {
            "anon" => Some(Role::Anon),
            "user" => Some(Role::User),
            name => self
                .custom
                .iter()
                .position(|(n, _)| n == name)
                .map(Role::Custom),
        }
    }

    pub fn name(&self, role: Role) -> &str {
        match role {
            Role::Anon => "anon",
            Role::User => "user",
            Role::Custom(i) => self.custom.get(i).map(|(n, _)| n.as_str()).unwrap_or(""),
        }
    }

    pub fn table(&self, role: Role, table: &str) -> Option<&TablePerms> {
        self.perms.get(&(role, table.to_string()))
    }

    /// Tables without a config entry are blocked for anonymous and
    /// custom roles when `default_block` is on.
    pub fn default_blocked(&self, role: Role) -> bool {
        role != Role::User && self.default_block
    }

    /// Custom roles with their `match` expressions in declaration order.
    pub fn custom_roles(&self) -> impl Iterator<Item = (&str, &str)> {
        self.custom.iter().map(|(n, m)| (n.as_str(), m.as_str()))
    }

    pub fn has_custom_roles(&self) -> bool {
        !self.custom.is_empty()
    }
}

fn parse_filters(
    filters: &[String],
    ctx: &dyn Fn(String) -> ConfigError,
) -> Result<Vec<Node>, ConfigError> {
    filters
        .iter()
        .map(|f| match parse_value(f) {
            Ok(n @ Node::Obj(_)) => Ok(n),
            Ok(n) => Err(ctx(format!("expecting an object, found {}", n.kind()))),
            Err(e) => Err(ctx(e.to_string())),
        })
        .collect()
}

fn query_perms(q: &QueryConfig, ctx: &dyn Fn(String) -> ConfigError) -> Result<QueryPerms, ConfigError> {
    Ok(QueryPerms {
        limit: (q.limit != 0).then_some(q.limit),
        filters: parse_filters(&q.filters, ctx)?,
        columns: q.columns.iter().cloned().collect(),
        disable_functions: q.disable_functions,
        block: q.block,
    })
}

fn mutation_perms(
    m: Option<&MutationConfig>,
    ctx: &dyn Fn(String) -> ConfigError,
) -> Result<Option<MutationPerms>, ConfigError> {
    let Some(m) = m else { return Ok(None) };
    let mut presets: Vec<(String, Preset)> = m
        .presets
        .iter()
        .map(|(k, v)| (k.clone(), Preset::parse(v)))
        .collect();
    presets.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(Some(MutationPerms {
        filters: parse_filters(&m.filters, ctx)?,
        columns: m.columns.iter().cloned().collect(),
        presets,
        block: m.block,
    }))
}
