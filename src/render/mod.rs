//! SQL renderer.
//!
//! Turns a [`QCode`] into one statement returning a single JSON value.
//! Every select becomes a subquery building its JSON inside the database;
//! nested selects are joined with `LEFT OUTER JOIN LATERAL` so the whole
//! result tree comes back in one round trip. Selects are rendered in
//! reverse id order: children always have larger ids than their parent,
//! so a child's SQL is ready by the time its parent needs it.

mod exp;
mod mutate;
mod query;

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::exec::bind_value;
use crate::qcode::QCode;
use crate::qcode::roles::RoleRegistry;
use crate::schema::DBSchema;
use crate::sql::Dialect;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("unknown column '{1}' on '{0}'")]
    ColumnNotFound(String, String),

    #[error("select {0} is missing")]
    SelectMissing(usize),

    #[error("mutation step {0} is missing")]
    StepMissing(usize),
}

/// A bind parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Variable name without the `$`
    pub name: String,
    pub typ: String,
    pub array: bool,
}

/// Parameters of a rendered statement. Each variable is bound once no
/// matter how often it is referenced, except with `?` placeholders,
/// which are positional and bound once per occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    params: Vec<Param>,
    binds: Vec<usize>,
}

/// Stands in for a positional placeholder until the statement is done.
const MARK: char = '\u{1}';

impl Metadata {
    /// Register a use of `name`, returning its parameter index.
    fn add(&mut self, name: &str, typ: &str, array: bool) -> usize {
        match self.params.iter().position(|p| p.name == name) {
            Some(i) => i,
            None => {
                self.params.push(Param {
                    name: name.to_string(),
                    typ: typ.to_string(),
                    array,
                });
                self.params.len() - 1
            }
        }
    }

    /// Placeholder text for parameter `idx`.
    fn placeholder(d: Dialect, idx: usize) -> String {
        if d.is_mysql() {
            format!("{}{}{}", MARK, idx, MARK)
        } else {
            d.placeholder(idx + 1)
        }
    }

    /// Resolve positional markers in textual order.
    fn finish(&mut self, d: Dialect, sql: String) -> String {
        if !d.is_mysql() {
            self.binds = (0..self.params.len()).collect();
            return sql;
        }
        let mut out = String::with_capacity(sql.len());
        let mut parts = sql.split(MARK);
        if let Some(head) = parts.next() {
            out.push_str(head);
        }
        while let (Some(idx), Some(text)) = (parts.next(), parts.next()) {
            if let Ok(i) = idx.parse::<usize>() {
                self.binds.push(i);
            }
            out.push('?');
            out.push_str(text);
        }
        out
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter index of every placeholder in bind order.
    pub fn binds(&self) -> &[usize] {
        &self.binds
    }

    /// Text arguments for the statement, `None` for missing or null
    /// variables.
    pub fn args(&self, vars: &Map<String, Value>) -> Vec<Option<String>> {
        self.binds
            .iter()
            .map(|&i| vars.get(&self.params[i].name).and_then(bind_value))
            .collect()
    }
}

/// A rendered statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub meta: Metadata,
}

pub struct Renderer {
    dialect: Dialect,
    /// Configured variables, inlined instead of bound
    vars: HashMap<String, String>,
}

impl Renderer {
    pub fn new(dialect: Dialect, vars: HashMap<String, String>) -> Self {
        let dialect = match dialect {
            Dialect::MySQL => Dialect::MySQL,
            _ => Dialect::PostgreSQL,
        };
        Self { dialect, vars }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn render(&self, qc: &QCode, schema: &DBSchema) -> Result<Statement, RenderError> {
        let mut cx = Ctx::new(self, qc, schema);
        let sql = cx.statement()?;
        let sql = cx.md.finish(self.dialect, sql);
        debug!(name = %qc.name, params = cx.md.params().len(), "rendered");
        Ok(Statement { sql, meta: cx.md })
    }

    /// Statement picking the role of the current user for attribute based
    /// access control. Custom role `match` expressions are evaluated in
    /// order against the row returned by `roles_query`, falling back to
    /// `user`. Variables in the query are bound as parameters.
    pub fn roles_query(&self, roles_query: &str, roles: &RoleRegistry) -> Result<Statement, RenderError> {
        let mut md = Metadata::default();
        let mut inner = String::with_capacity(roles_query.len());
        let mut rest = roles_query;
        while let Some(i) = rest.find('$') {
            inner.push_str(&rest[..i]);
            let after = &rest[i + 1..];
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if end == 0 || after.starts_with(|c: char| c.is_ascii_digit()) {
                inner.push('$');
                rest = after;
                continue;
            }
            let n = md.add(&after[..end], "text", false);
            inner.push_str(&Metadata::placeholder(self.dialect, n));
            rest = &after[end..];
        }
        inner.push_str(rest);

        let mut case = String::from("CASE");
        for (name, expr) in roles.custom_roles() {
            case.push_str(" WHEN (");
            case.push_str(expr);
            case.push_str(") THEN ");
            case.push_str(&literal(self.dialect, name));
        }
        case.push_str(" ELSE 'user' END");

        let sql = if self.dialect.is_mysql() {
            format!(
                "SELECT JSON_QUOTE({}) FROM ({}) AS `__roles` LIMIT 1",
                case, inner
            )
        } else {
            format!(
                "SELECT to_jsonb({}) FROM ({}) AS \"__roles\" LIMIT 1",
                case, inner
            )
        };
        let sql = md.finish(self.dialect, sql);
        Ok(Statement { sql, meta: md })
    }
}

/// SQL string literal.
fn literal(d: Dialect, s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' if d.is_mysql() => out.push_str("\\\\"),
            MARK => {}
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// State of one render.
struct Ctx<'a> {
    d: Dialect,
    vars: &'a HashMap<String, String>,
    qc: &'a QCode,
    schema: &'a DBSchema,
    md: Metadata,
    /// Table alias of every select
    aliases: Vec<String>,
    /// Mutation CTEs named after their table, read in place of it
    ctes: HashSet<String>,
}

impl<'a> Ctx<'a> {
    fn new(r: &'a Renderer, qc: &'a QCode, schema: &'a DBSchema) -> Self {
        // a select on the same table as one of its ancestors needs its
        // own alias to reach the ancestor's columns
        let mut aliases = Vec::with_capacity(qc.selects.len());
        for s in &qc.selects {
            let mut clash = false;
            let mut cur = s.parent_id;
            while let Some(p) = cur {
                if qc.selects[p].table == s.table {
                    clash = true;
                    break;
                }
                cur = qc.selects[p].parent_id;
            }
            aliases.push(if clash {
                format!("{}__{}", s.table, s.id)
            } else {
                s.table.clone()
            });
        }

        let ctes = qc
            .mutation
            .iter()
            .flat_map(|m| m.items.iter())
            .filter(|i| i.cte == i.table)
            .map(|i| i.cte.clone())
            .collect();

        Self {
            d: r.dialect,
            vars: &r.vars,
            qc,
            schema,
            md: Metadata::default(),
            aliases,
            ctes,
        }
    }

    fn q(&self, ident: &str) -> String {
        self.d.quote(ident)
    }

    fn lit(&self, s: &str) -> String {
        literal(self.d, s)
    }

    /// A table, or the mutation CTE standing in for it.
    fn table(&self, schema: &str, table: &str) -> String {
        if self.ctes.contains(table) || schema.is_empty() {
            self.q(table)
        } else {
            format!("{}.{}", self.q(schema), self.q(table))
        }
    }

    fn col(&self, table: &str, col: &str) -> String {
        format!("{}.{}", self.q(table), self.q(col))
    }

    /// Placeholder for variable `name` compared with a column of type
    /// `typ`. Configured variables are inlined.
    fn param(&mut self, name: &str, typ: &str, array: bool) -> String {
        if let Some(v) = self.vars.get(name) {
            return match v.strip_prefix("sql:") {
                Some(sql) => sql.trim().to_string(),
                None if self.d.is_mysql() || typ.is_empty() => self.lit(v),
                None => format!("{} :: {}", self.lit(v), typ),
            };
        }

        let ph = Metadata::placeholder(self.d, self.md.add(name, typ, array));
        match (self.d.is_mysql(), array) {
            (true, true) => format!("CAST({} AS JSON)", ph),
            (true, false) => ph,
            (false, true) => format!("ARRAY(SELECT json_array_elements_text({} :: json)) :: {}[]", ph, typ),
            (false, false) if typ.is_empty() => ph,
            (false, false) => format!("{} :: {}", ph, typ),
        }
    }

    fn json_object(&self) -> &'static str {
        if self.d.is_mysql() { "json_object" } else { "jsonb_build_object" }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::qcode::tests::{compiler, open_config};
    use crate::qcode::{CompileError, Compiler};

    pub(super) fn render_with(c: &Compiler, q: &str, vars: Value, role: &str) -> Statement {
        let vars = vars.as_object().cloned().unwrap_or_default();
        let qc = c.compile(q, &vars, role).unwrap();
        Renderer::new(Dialect::PostgreSQL, HashMap::new())
            .render(&qc, c.schema())
            .unwrap()
    }

    pub(super) fn render(q: &str) -> Statement {
        render_with(&compiler(&open_config()), q, json!({}), "user")
    }

    #[test]
    fn test_single_lateral_for_owner() {
        let st = render("{ products(limit: 3) { id owner { id full_name } } }");
        assert_eq!(st.sql.matches("LATERAL").count(), 1);
        assert!(st.sql.contains("LIMIT 3"));
        assert!(st.sql.starts_with("SELECT jsonb_build_object('products', \"__sj_0\".\"json\")"));
        assert!(st.sql.contains("\"users\".\"id\" = \"products\".\"owner_id\""));
        assert!(st.meta.is_empty());
    }

    #[test]
    fn test_variables_bound_once() {
        let st = render(
            "{ products(where: { or: [{ id: { eq: $id } }, { owner_id: { eq: $id } }] }, limit: $limit) { id } }",
        );
        assert_eq!(
            st.meta.params(),
            &[
                Param {
                    name: "id".into(),
                    typ: "bigint".into(),
                    array: false
                },
                Param {
                    name: "limit".into(),
                    typ: "integer".into(),
                    array: false
                },
            ]
        );
        assert_eq!(st.sql.matches("$1 :: bigint").count(), 2);
        assert!(st.sql.contains("LIMIT $2 :: integer"));

        let args = st.meta.args(&json!({"id": 5, "limit": 2}).as_object().cloned().unwrap());
        assert_eq!(args, vec![Some("5".into()), Some("2".into())]);
    }

    #[test]
    fn test_positional_placeholders_repeat() {
        let c = compiler(&open_config());
        let qc = c
            .compile(
                "{ products(where: { or: [{ id: { eq: $id } }, { owner_id: { eq: $id } }] }) { id } }",
                &Map::new(),
                "user",
            )
            .unwrap();
        let st = Renderer::new(Dialect::MySQL, HashMap::new())
            .render(&qc, c.schema())
            .unwrap();
        assert_eq!(st.meta.params().len(), 1);
        assert_eq!(st.meta.binds(), &[0, 0]);
        assert!(st.sql.starts_with("SELECT json_object('products', `__sj_0`.`json`)"));
        assert!(st.sql.contains("json_arrayagg"));
    }

    #[test]
    fn test_deterministic_sql() {
        let q = "{ products(where: { price: { gt: $p } }, order_by: { price: desc }) { id owner { email } customers { id } } }";
        let a = render(q);
        let b = render(q);
        assert_eq!(a, b);
    }

    #[test]
    fn test_role_filter_kept_next_to_user_filter() {
        let conf = Config::from_json(
            r#"{ "roles": [{ "name": "user", "tables": [{ "name": "products",
                "query": { "filters": ["{ owner_id: { eq: $user_id } }"] } }] }] }"#,
        )
        .unwrap();
        let c = compiler(&conf);
        let st = render_with(
            &c,
            "{ products(where: { or: [{ price: { gt: 1 } }, { id: { eq: 2 } }] }) { id } }",
            json!({}),
            "user",
        );
        assert!(st.sql.contains(
            "WHERE ((\"products\".\"owner_id\" = $1 :: bigint) AND ((\"products\".\"price\" > 1) OR (\"products\".\"id\" = 2)))"
        ));
    }

    #[test]
    fn test_skipped_selects_render_null() {
        let conf = Config::from_json(
            r#"{ "roles": [{ "name": "anon", "tables": [{ "name": "products" }] }] }"#,
        )
        .unwrap();
        let c = compiler(&conf);
        let st = render_with(&c, "{ users { id } products { id } }", json!({}), "anon");
        assert!(st.sql.starts_with("SELECT jsonb_build_object('users', NULL, 'products', \"__sj_1\".\"json\")"));
    }

    #[test]
    fn test_config_vars_inlined() {
        let conf = Config::from_json(
            r#"{ "vars": { "admin_id": "1", "now": "sql:now()" },
                 "roles": [{ "name": "user", "tables": [{ "name": "products",
                    "query": { "filters": ["{ owner_id: { eq: $admin_id }, created_at: { lt: $now } }"] } }] }] }"#,
        )
        .unwrap();
        let c = compiler(&conf);
        let qc = c.compile("{ products { id } }", &Map::new(), "user").unwrap();
        let st = Renderer::new(Dialect::PostgreSQL, conf.vars.clone())
            .render(&qc, c.schema())
            .unwrap();
        assert!(st.sql.contains("\"products\".\"owner_id\" = '1' :: bigint"));
        assert!(st.sql.contains("\"products\".\"created_at\" < now()"));
        assert!(st.meta.is_empty());
    }

    #[test]
    fn test_roles_query() {
        let conf = Config::from_json(
            r#"{ "roles_query": "SELECT * FROM users WHERE id = $user_id :: bigint",
                 "roles": [
                    { "name": "admin", "match": "id = 1000" },
                    { "name": "disabled_user", "match": "disabled = true" }
                 ] }"#,
        )
        .unwrap();
        let schema = Arc::new(DBSchema::new(&crate::schema::testdata::dbinfo(), &[]).unwrap());
        let roles = RoleRegistry::new(&conf, &schema).unwrap();
        let st = Renderer::new(Dialect::PostgreSQL, HashMap::new())
            .roles_query(conf.roles_query.as_deref().unwrap(), &roles)
            .unwrap();
        assert_eq!(
            st.sql,
            "SELECT to_jsonb(CASE WHEN (id = 1000) THEN 'admin' WHEN (disabled = true) THEN 'disabled_user' \
             ELSE 'user' END) FROM (SELECT * FROM users WHERE id = $1 :: bigint) AS \"__roles\" LIMIT 1"
        );
        assert_eq!(st.meta.params()[0].name, "user_id");
    }

    #[test]
    fn test_literals_are_escaped() {
        assert_eq!(literal(Dialect::PostgreSQL, "it's"), "'it''s'");
        assert_eq!(literal(Dialect::MySQL, "a\\'b"), "'a\\\\''b'");
    }

    #[test]
    fn test_compile_errors_stop_before_render() {
        let c = compiler(&open_config());
        assert!(matches!(
            c.compile("{ products { nope } }", &Map::new(), "user"),
            Err(CompileError::Schema(_))
        ));
    }
}
