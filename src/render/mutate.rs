//! Mutation steps, one data modifying CTE each.

use crate::qcode::mutate::Link;
use crate::qcode::roles::Preset;
use crate::qcode::{Mutate, MutateKind, Mutation};

use super::exp::Remap;
use super::{Ctx, RenderError};

impl Ctx<'_> {
    pub(super) fn mutation_ctes(&mut self, m: &Mutation) -> Result<Vec<String>, RenderError> {
        let mut out = Vec::with_capacity(m.items.len());
        for it in &m.items {
            let sql = match it.kind {
                MutateKind::Insert | MutateKind::Upsert => self.insert(m, it)?,
                MutateKind::Update => self.update(m, it)?,
                MutateKind::Delete => self.delete(it)?,
                MutateKind::Connect | MutateKind::Disconnect => self.connect(m, it)?,
                MutateKind::Lookup => {
                    let keys = self.keys(m, it)?;
                    format!("SELECT * FROM {} WHERE {}", self.target(it), keys)
                }
            };
            out.push(format!("{} AS ({})", self.q(&it.cte), sql));
        }
        Ok(out)
    }

    /// The table itself, never the CTE standing in for it.
    fn target(&self, it: &Mutate) -> String {
        format!("{}.{}", self.q(&it.schema), self.q(&it.table))
    }

    fn link(&self, m: &Mutation, l: &Link) -> Result<String, RenderError> {
        let from = m.item(l.from).ok_or(RenderError::StepMissing(l.from))?;
        Ok(format!(
            "(SELECT {} FROM {})",
            self.q(&l.from_col.name),
            self.q(&from.cte)
        ))
    }

    /// Input variable narrowed to this step's part of it.
    fn input(&mut self, m: &Mutation, it: &Mutate, last_text: Option<&str>) -> Result<String, RenderError> {
        let var = m
            .var
            .as_deref()
            .ok_or_else(|| RenderError::Unsupported(format!("{} without input", it.table)))?;
        let mut out = self.param(var, "json", false);
        for k in &it.path {
            out.push_str(" -> ");
            out.push_str(&self.lit(k));
        }
        if let Some(k) = last_text {
            out.push_str(" ->> ");
            out.push_str(&self.lit(k));
        }
        Ok(out)
    }

    fn source(&mut self, m: &Mutation, it: &Mutate) -> Result<String, RenderError> {
        let input = self.input(m, it, None)?;
        let func = if it.array {
            "json_populate_recordset"
        } else {
            "json_populate_record"
        };
        Ok(format!(
            "{}(NULL :: {}, {}) AS {}",
            func,
            self.target(it),
            input,
            self.q("t")
        ))
    }

    /// Columns written by a step with their values. Presets win over
    /// links, links over nulls, nulls over input.
    fn assignments(&mut self, m: &Mutation, it: &Mutate) -> Result<Vec<(String, String)>, RenderError> {
        let mut out: Vec<(String, String)> = Vec::new();
        let has = |out: &Vec<(String, String)>, n: &str| out.iter().any(|(c, _)| c == n);

        for (col, p) in &it.presets {
            if has(&out, &col.name) {
                continue;
            }
            let v = match p {
                Preset::Sql(sql) => sql.clone(),
                Preset::Var(v) => self.param(v, &col.typ, col.array),
                Preset::Value(v) => format!("{} :: {}", self.lit(v), col.typ),
            };
            out.push((col.name.clone(), v));
        }
        for l in &it.links {
            if !has(&out, &l.col.name) {
                out.push((l.col.name.clone(), self.link(m, l)?));
            }
        }
        for c in &it.nulls {
            if !has(&out, &c.name) {
                out.push((c.name.clone(), "NULL".to_string()));
            }
        }
        for c in &it.cols {
            if !has(&out, &c.name) {
                out.push((c.name.clone(), self.col("t", &c.name)));
            }
        }
        Ok(out)
    }

    fn insert(&mut self, m: &Mutation, it: &Mutate) -> Result<String, RenderError> {
        let set = self.assignments(m, it)?;
        let source = self.source(m, it)?;
        let cols: Vec<String> = set.iter().map(|(c, _)| self.q(c)).collect();
        let vals: Vec<&str> = set.iter().map(|(_, v)| v.as_str()).collect();

        let mut out = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.target(it),
            cols.join(", "),
            vals.join(", "),
            source
        );

        if it.kind == MutateKind::Upsert {
            let Some(target) = &it.conflict else {
                return Err(RenderError::Unsupported(format!("upsert into {} without a conflict target", it.table)));
            };
            let updates: Vec<String> = set
                .iter()
                .filter(|(c, _)| *c != target.name)
                .map(|(c, _)| format!("{} = EXCLUDED.{}", self.q(c), self.q(c)))
                .collect();
            if updates.is_empty() {
                out.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", self.q(&target.name)));
            } else {
                out.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    self.q(&target.name),
                    updates.join(", ")
                ));
                if let Some(f) = &it.filter {
                    out.push_str(" WHERE ");
                    out.push_str(&self.exp(f, Remap::none())?);
                }
            }
        }
        out.push_str(" RETURNING *");
        Ok(out)
    }

    fn update(&mut self, m: &Mutation, it: &Mutate) -> Result<String, RenderError> {
        if it.array {
            return Err(RenderError::Unsupported(format!("updating {} from a list", it.table)));
        }
        let set = self.assignments(m, it)?;

        let mut wh = Vec::new();
        if let Some(f) = &it.filter {
            wh.push(self.exp(f, Remap::none())?);
        }
        if let Some(j) = &it.join {
            wh.push(self.join_cond(m, it, j)?);
        }
        let wh = if wh.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", wh.join(" AND "))
        };

        if set.is_empty() {
            return Ok(format!("SELECT * FROM {}{}", self.target(it), wh));
        }
        let source = self.source(m, it)?;
        let set: Vec<String> = set
            .iter()
            .map(|(c, v)| format!("{} = {}", self.q(c), v))
            .collect();
        Ok(format!(
            "UPDATE {} SET {} FROM {}{} RETURNING {}.*",
            self.target(it),
            set.join(", "),
            source,
            wh,
            self.q(&it.table)
        ))
    }

    fn delete(&mut self, it: &Mutate) -> Result<String, RenderError> {
        let Some(f) = &it.filter else {
            return Err(RenderError::Unsupported(format!("delete from {} without a filter", it.table)));
        };
        let wh = self.exp(f, Remap::none())?;
        Ok(format!("DELETE FROM {} WHERE {} RETURNING *", self.target(it), wh))
    }

    fn connect(&mut self, m: &Mutation, it: &Mutate) -> Result<String, RenderError> {
        let set = self.assignments(m, it)?;
        let mut wh = vec![self.keys(m, it)?];
        if let Some(j) = &it.join {
            wh.push(self.join_cond(m, it, j)?);
        }
        let set: Vec<String> = set
            .iter()
            .map(|(c, v)| format!("{} = {}", self.q(c), v))
            .collect();
        Ok(format!(
            "UPDATE {} SET {} WHERE {} RETURNING *",
            self.target(it),
            set.join(", "),
            wh.join(" AND ")
        ))
    }

    fn join_cond(&self, m: &Mutation, it: &Mutate, j: &Link) -> Result<String, RenderError> {
        let from = m.item(j.from).ok_or(RenderError::StepMissing(j.from))?;
        Ok(format!(
            "{} IN (SELECT {} FROM {})",
            self.col(&it.table, &j.col.name),
            self.q(&j.from_col.name),
            self.q(&from.cte)
        ))
    }

    /// Rows named by the key columns of a connect or disconnect.
    fn keys(&mut self, m: &Mutation, it: &Mutate) -> Result<String, RenderError> {
        let mut out = Vec::with_capacity(it.keys.len());
        for (col, list) in &it.keys {
            let c = self.col(&it.table, &col.name);
            if *list {
                let mut input = self.input(m, it, None)?;
                input.push_str(" -> ");
                input.push_str(&self.lit(&col.name));
                out.push(format!(
                    "{} = ANY(ARRAY(SELECT json_array_elements_text({})) :: {}[])",
                    c, input, col.typ
                ));
            } else {
                let input = self.input(m, it, Some(&col.name))?;
                out.push(format!("{} = ({}) :: {}", c, input, col.typ));
            }
        }
        if out.is_empty() {
            return Err(RenderError::Unsupported(format!("{} without key columns", it.table)));
        }
        Ok(out.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::super::{Renderer, Statement};
    use crate::config::Config;
    use crate::qcode::tests::compiler;
    use crate::sql::Dialect;

    fn conf() -> Config {
        Config::from_json(
            r#"{ "roles": [
                { "name": "user", "tables": [
                    { "name": "users", "insert": {}, "update": {}, "upsert": {}, "delete": {} },
                    { "name": "products", "insert": { "presets": { "owner_id": "$user_id", "created_at": "sql:now()" } }, "update": {} }
                ] }
            ] }"#,
        )
        .unwrap()
    }

    fn render(q: &str, vars: Value) -> Statement {
        let c = compiler(&conf());
        let vars = vars.as_object().cloned().unwrap_or_default();
        let qc = c.compile(q, &vars, "user").unwrap();
        Renderer::new(Dialect::PostgreSQL, HashMap::new())
            .render(&qc, c.schema())
            .unwrap()
    }

    #[test]
    fn test_nested_insert() {
        let st = render(
            "mutation { users(insert: $data) { id products { id } } }",
            json!({"data": {"email": "a@b.com", "products": [{"name": "p1", "price": 1}]}}),
        );
        assert!(st.sql.starts_with(
            "WITH \"users\" AS (INSERT INTO \"public\".\"users\" (\"email\") SELECT \"t\".\"email\" \
             FROM json_populate_record(NULL :: \"public\".\"users\", $1 :: json) AS \"t\" RETURNING *), \
             \"products\" AS (INSERT INTO \"public\".\"products\" (\"created_at\", \"owner_id\", \"name\", \"price\") \
             SELECT now(), $2 :: bigint, \"t\".\"name\", \"t\".\"price\" \
             FROM json_populate_recordset(NULL :: \"public\".\"products\", $1 :: json -> 'products') AS \"t\" RETURNING *) \
             SELECT jsonb_build_object('users', \"__sj_0\".\"json\")"
        ));
        // the result reads the written rows
        assert!(st.sql.contains("FROM \"users\" AS \"users\""));
        assert!(st.sql.contains("FROM \"products\" AS \"products\""));
        let names: Vec<&str> = st.meta.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["data", "user_id"]);
    }

    #[test]
    fn test_insert_link_from_lookup() {
        let st = render(
            "mutation { products(insert: $data) { id } }",
            json!({"data": {"name": "p", "owner": {"connect": {"id": 5}}}}),
        );
        assert!(st.sql.starts_with(
            "WITH \"users\" AS (SELECT * FROM \"public\".\"users\" \
             WHERE \"users\".\"id\" = ($1 :: json -> 'owner' -> 'connect' ->> 'id') :: bigint)"
        ));
        // the preset beats the connected owner
        assert!(st.sql.contains("(\"created_at\", \"owner_id\", \"name\") SELECT now(), $2 :: bigint, \"t\".\"name\""));
    }

    #[test]
    fn test_update_with_disconnect() {
        let st = render(
            "mutation { users(update: $data, id: 1) { id } }",
            json!({"data": {"full_name": "B", "products": {"disconnect": {"id": [1, 2]}}}}),
        );
        assert!(st.sql.contains(
            "\"users\" AS (UPDATE \"public\".\"users\" SET \"full_name\" = \"t\".\"full_name\" \
             FROM json_populate_record(NULL :: \"public\".\"users\", $1 :: json) AS \"t\" \
             WHERE (\"users\".\"id\" = 1) RETURNING \"users\".*)"
        ));
        assert!(st.sql.contains(
            "UPDATE \"public\".\"products\" SET \"owner_id\" = NULL \
             WHERE \"products\".\"id\" = ANY(ARRAY(SELECT json_array_elements_text($1 :: json -> 'products' -> 'disconnect' -> 'id')) :: bigint[]) \
             AND \"products\".\"owner_id\" IN (SELECT \"id\" FROM \"users\") RETURNING *"
        ));
    }

    #[test]
    fn test_upsert_and_delete() {
        let st = render(
            "mutation { users(upsert: $data) { id } }",
            json!({"data": {"email": "a@b.com", "full_name": "A"}}),
        );
        assert!(st.sql.contains(
            "ON CONFLICT (\"email\") DO UPDATE SET \"full_name\" = EXCLUDED.\"full_name\" RETURNING *"
        ));

        let st = render("mutation { users(delete: true, id: 7) { id } }", json!({}));
        assert!(st.sql.starts_with(
            "WITH \"users\" AS (DELETE FROM \"public\".\"users\" WHERE (\"users\".\"id\" = 7) RETURNING *)"
        ));
    }

    #[test]
    fn test_mutations_unsupported_on_mysql() {
        let c = compiler(&conf());
        let vars = json!({"data": {"email": "a"}}).as_object().cloned().unwrap();
        let qc = c.compile("mutation { users(insert: $data) { id } }", &vars, "user").unwrap();
        assert!(Renderer::new(Dialect::MySQL, HashMap::new()).render(&qc, c.schema()).is_err());
    }
}
