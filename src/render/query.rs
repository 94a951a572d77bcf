//! Select rendering.
//!
//! Each select produces one row with a `json` column. Plural selects
//! aggregate their rows into an array; the last row's sort key comes
//! back as `__cursor` when the select pages by cursor.

use crate::qcode::{ColRef, Count, FieldCond, FieldKind, Find, Order, OrderBy, SelType, Select, Skip, Val, rel_join};
use crate::schema::{DBRel, RelType, TableType};

use super::exp::Remap;
use super::{Ctx, RenderError};

impl Ctx<'_> {
    pub(super) fn statement(&mut self) -> Result<String, RenderError> {
        let qc = self.qc;
        let mut ctes = Vec::new();
        if let Some(m) = &qc.mutation {
            if self.d.is_mysql() {
                return Err(RenderError::Unsupported("mutations on mysql".into()));
            }
            ctes = self.mutation_ctes(m)?;
        }
        for s in &qc.selects {
            if s.skip == Skip::None && s.paging.is_cursor() {
                if self.d.is_mysql() {
                    return Err(RenderError::Unsupported("cursor paging on mysql".into()));
                }
                ctes.push(self.cursor_cte(s));
            }
        }

        let mut done: Vec<Option<String>> = vec![None; qc.selects.len()];
        for s in qc.selects.iter().rev() {
            if s.skip == Skip::None {
                done[s.id] = Some(self.select(s, &mut done)?);
            }
        }

        let mut pairs = Vec::with_capacity(qc.roots.len());
        let mut from = Vec::new();
        for &id in &qc.roots {
            let s = qc.selects.get(id).ok_or(RenderError::SelectMissing(id))?;
            if s.skip != Skip::None {
                pairs.push(format!("{}, NULL", self.lit(&s.key)));
                continue;
            }
            let sql = done[id].take().ok_or(RenderError::SelectMissing(id))?;
            let val = if s.singular {
                format!("({})", sql)
            } else {
                let sj = self.q(&format!("__sj_{}", id));
                from.push(format!("({}) AS {}", sql, sj));
                format!("{}.{}", sj, self.q("json"))
            };
            pairs.push(format!("{}, {}", self.lit(&s.key), self.cond(s.cond.as_ref(), val)));
            if !s.singular && s.paging.is_cursor() {
                let cur = format!("{}.{}", self.q(&format!("__sj_{}", id)), self.q("__cursor"));
                pairs.push(format!(
                    "{}, {}",
                    self.lit(&format!("{}_cursor", s.key)),
                    self.cond(s.cond.as_ref(), cur)
                ));
            }
        }

        let mut out = String::new();
        if !ctes.is_empty() {
            out.push_str("WITH ");
            out.push_str(&ctes.join(", "));
            out.push(' ');
        }
        out.push_str("SELECT ");
        out.push_str(self.json_object());
        out.push('(');
        out.push_str(&pairs.join(", "));
        out.push_str(") AS ");
        out.push_str(&self.q("__root"));
        if !from.is_empty() {
            out.push_str(" FROM ");
            out.push_str(&from.join(", "));
        }
        Ok(out)
    }

    /// `value` shown only when the `@include`/`@skip` variable allows it.
    fn cond(&mut self, cond: Option<&FieldCond>, value: String) -> String {
        let Some(c) = cond else { return value };
        let p = self.param(&c.var, "boolean", false);
        if c.include {
            format!("(CASE WHEN {} THEN {} ELSE NULL END)", p, value)
        } else {
            format!("(CASE WHEN {} THEN NULL ELSE {} END)", p, value)
        }
    }

    /// Values read by the keyset condition of a cursor paged select.
    fn cursor_cte(&mut self, s: &Select) -> String {
        let name = self.q(&format!("__cur_{}", s.id));
        let Some(var) = &s.paging.cursor else {
            let cols: Vec<String> = s
                .order_by
                .iter()
                .map(|o| format!("NULL :: {} AS {}", o.col.typ, self.q(&o.col.name)))
                .collect();
            return format!("{} AS (SELECT {} WHERE false)", name, cols.join(", "));
        };
        let p = self.param(var, "jsonb", false);
        let cols: Vec<String> = s
            .order_by
            .iter()
            .enumerate()
            .map(|(i, o)| format!("(({}) ->> {}) :: {} AS {}", p, i, o.col.typ, self.q(&o.col.name)))
            .collect();
        format!("{} AS (SELECT {} WHERE {} IS NOT NULL)", name, cols.join(", "), p)
    }

    fn select(&mut self, s: &Select, done: &mut [Option<String>]) -> Result<String, RenderError> {
        if s.typ == SelType::Union {
            return self.union(s, done);
        }

        let alias = self.aliases[s.id].clone();
        let qa = self.q(&alias);
        let base = self.base(s)?;
        let obj = self.json_fields(s, &alias)?;
        let joins = self.child_joins(s, done)?;
        let jo = self.json_object();
        let json = self.q("json");

        if s.singular {
            return Ok(format!(
                "SELECT {}({}) AS {} FROM ({}) AS {}{}",
                jo, obj, json, base, qa, joins
            ));
        }

        let sr = self.q(&format!("__sr_{}", s.id));
        let cursor = s.paging.is_cursor();
        let mut inner = format!("SELECT {}({}) AS {}", jo, obj, json);
        if cursor {
            let keys: Vec<String> = s
                .order_by
                .iter()
                .map(|o| self.col(&alias, &o.col.name))
                .collect();
            inner.push_str(&format!(
                ", jsonb_build_array({}) AS {}",
                keys.join(", "),
                self.q("__cursor")
            ));
        }
        inner.push_str(&format!(" FROM ({}) AS {}{}", base, qa, joins));
        let order = self.order_by(s, &alias);
        if !order.is_empty() {
            inner.push_str(" ORDER BY ");
            inner.push_str(&order);
        }

        let agg = if self.d.is_mysql() {
            format!("coalesce(json_arrayagg({}.{}), json_array())", sr, json)
        } else {
            format!("coalesce(jsonb_agg({}.{}), '[]')", sr, json)
        };
        let mut out = format!("SELECT {} AS {}", agg, json);
        if cursor {
            out.push_str(&format!(
                ", (jsonb_agg({}.{}) -> -1) :: text AS {}",
                sr,
                self.q("__cursor"),
                self.q("__cursor")
            ));
        }
        out.push_str(&format!(" FROM ({}) AS {}", inner, sr));
        Ok(out)
    }

    /// The first member matching the discriminator wins.
    fn union(&mut self, s: &Select, done: &mut [Option<String>]) -> Result<String, RenderError> {
        let mut members = Vec::new();
        for f in &s.fields {
            let FieldKind::Child(m) = f.kind else { continue };
            if let Some(sql) = done[m].take() {
                members.push(format!("({})", sql));
            }
        }
        let json = self.q("json");
        if members.is_empty() {
            return Ok(format!("SELECT NULL AS {}", json));
        }
        Ok(format!("SELECT coalesce({}) AS {}", members.join(", "), json))
    }

    fn json_fields(&mut self, s: &Select, alias: &str) -> Result<String, RenderError> {
        let qc = self.qc;
        let mut pairs = Vec::with_capacity(s.fields.len());
        for f in &s.fields {
            let key = self.lit(&f.key);
            if f.null {
                pairs.push(format!("{}, NULL", key));
                continue;
            }
            let val = match &f.kind {
                FieldKind::Typename(t) => self.lit(t),
                FieldKind::Child(c) => {
                    let child = qc.selects.get(*c).ok_or(RenderError::SelectMissing(*c))?;
                    let val = match child.skip {
                        Skip::None => format!("{}.{}", self.q(&format!("__sj_{}", c)), self.q("json")),
                        Skip::Remote => match &child.rel {
                            Some(rel) => self.col(alias, &rel.right.col.name),
                            None => "NULL".to_string(),
                        },
                        _ => "NULL".to_string(),
                    };
                    let val = self.cond(child.cond.as_ref(), val);
                    if child.skip == Skip::None && !child.singular && child.paging.is_cursor() {
                        let cur = format!("{}.{}", self.q(&format!("__sj_{}", c)), self.q("__cursor"));
                        let cur = self.cond(child.cond.as_ref(), cur);
                        pairs.push(format!("{}, {}", key, val));
                        pairs.push(format!("{}, {}", self.lit(&format!("{}_cursor", f.key)), cur));
                        continue;
                    }
                    val
                }
                _ => match f.alias() {
                    Some(a) => self.col(alias, &a),
                    None => "NULL".to_string(),
                },
            };
            let val = self.cond(f.cond.as_ref(), val);
            pairs.push(format!("{}, {}", key, val));
        }
        Ok(pairs.join(", "))
    }

    fn child_joins(&mut self, s: &Select, done: &mut [Option<String>]) -> Result<String, RenderError> {
        let mut out = String::new();
        let join = if self.d.is_mysql() {
            " LEFT JOIN LATERAL ("
        } else {
            " LEFT OUTER JOIN LATERAL ("
        };
        for &c in &s.children {
            if self.qc.selects[c].skip != Skip::None {
                continue;
            }
            let sql = done[c].take().ok_or(RenderError::SelectMissing(c))?;
            out.push_str(join);
            out.push_str(&sql);
            out.push_str(") AS ");
            out.push_str(&self.q(&format!("__sj_{}", c)));
            out.push_str(" ON true");
        }
        Ok(out)
    }

    /// Alias of the select this one joins against. Union members join
    /// the parent of their union.
    fn join_alias(&self, s: &Select) -> Option<String> {
        let mut p = s.parent_id?;
        if matches!(s.typ, SelType::Member(_)) {
            p = self.qc.selects[p].parent_id?;
        }
        Some(self.aliases[p].clone())
    }

    /// Row source of a select: its columns, plus whatever its children
    /// and its sort need.
    fn base(&mut self, s: &Select) -> Result<String, RenderError> {
        let alias = self.aliases[s.id].clone();
        let qa = self.q(&alias);
        let rel = s.rel.as_ref();
        let rel_typ = rel.map(|r| r.typ);
        let mut out = String::new();

        if let (Some(rel), Some(RelType::Recursive)) = (rel, rel_typ) {
            out.push_str(&self.recursive_cte(s, rel)?);
            out.push(' ');
        }

        let mut cols: Vec<Column> = Vec::new();
        for f in &s.fields {
            if f.null {
                continue;
            }
            let Some(name) = f.alias() else { continue };
            let expr = match &f.kind {
                FieldKind::Col(c) => self.col(&alias, &c.name),
                FieldKind::Agg { func, col } => format!("{}({})", func, self.col(&alias, &col.name)),
                FieldKind::Func { name, col, .. } => format!("{}({})", self.q(name), self.col(&alias, &col.name)),
                FieldKind::SearchRank => self.search_rank(s, &alias)?,
                FieldKind::Typename(_) | FieldKind::Child(_) => continue,
            };
            push_col(&mut cols, expr, name, f.is_agg());
        }
        for name in self.child_cols(s) {
            push_col(&mut cols, self.col(&alias, &name), name, false);
        }
        for o in &s.order_by {
            push_col(&mut cols, self.col(&alias, &o.col.name), o.col.name.clone(), false);
        }
        if cols.is_empty() {
            push_col(&mut cols, "1".to_string(), "__one".to_string(), false);
        }

        out.push_str("SELECT ");
        if !s.distinct_on.is_empty() {
            if self.d.is_mysql() {
                return Err(RenderError::Unsupported("distinct_on on mysql".into()));
            }
            let on: Vec<String> = s.distinct_on.iter().map(|c| self.col(&alias, &c.name)).collect();
            out.push_str(&format!("DISTINCT ON ({}) ", on.join(", ")));
        }
        let list: Vec<String> = cols
            .iter()
            .map(|(e, n, _)| format!("{} AS {}", e, self.q(n)))
            .collect();
        out.push_str(&list.join(", "));

        out.push_str(" FROM ");
        let mut wh: Vec<String> = Vec::new();
        match (rel, rel_typ) {
            (Some(rel), Some(RelType::Embedded)) => out.push_str(&self.embedded_source(s, rel, &alias)?),
            (Some(rel), Some(RelType::Recursive)) => {
                out.push_str(&format!("{} AS {}", self.table(&s.schema, &s.table), qa));
                wh.push(format!(
                    "{} IN (SELECT {} FROM {})",
                    self.col(&alias, &rel.right.col.name),
                    self.q("__key"),
                    self.q(&format!("__rcte_{}", s.id))
                ));
            }
            (Some(rel), Some(_)) => {
                out.push_str(&format!("{} AS {}", self.table(&s.schema, &s.table), qa));
                let parent = self.join_alias(s).ok_or(RenderError::SelectMissing(s.id))?;
                let (on, th) = rel_join(rel, &alias, &parent);
                if let Some(th) = th {
                    let th_on = self.exp(&th.on, Remap::none())?;
                    out.push_str(&format!(
                        " INNER JOIN {} ON {}",
                        self.table(&th.schema, &th.table),
                        th_on
                    ));
                }
                wh.push(self.exp(&on, Remap::none())?);
                if let (Some(poly), SelType::Member(typ)) = (&rel.poly, &s.typ) {
                    wh.push(format!(
                        "({} = {})",
                        self.col(&parent, &poly.type_col.name),
                        self.lit(typ)
                    ));
                }
            }
            _ => out.push_str(&format!("{} AS {}", self.table(&s.schema, &s.table), qa)),
        }

        if let Some(f) = &s.filter {
            wh.push(self.exp(
                f,
                Remap {
                    from: &s.table,
                    to: &alias,
                },
            )?);
        }
        if !wh.is_empty() {
            out.push_str(" WHERE ");
            out.push_str(&wh.join(" AND "));
        }

        if s.is_grouped() {
            let group: Vec<&str> = cols
                .iter()
                .filter(|(e, _, agg)| !agg && e.as_str() != "1")
                .map(|(e, _, _)| e.as_str())
                .collect();
            if !group.is_empty() {
                out.push_str(" GROUP BY ");
                out.push_str(&group.join(", "));
            }
        }

        let order = self.order_by(s, &alias);
        if !order.is_empty() {
            out.push_str(" ORDER BY ");
            out.push_str(&order);
        }

        if s.singular {
            out.push_str(" LIMIT 1");
        } else if let Some(l) = &s.paging.limit {
            let l = self.count(l, s.paging.cap);
            out.push_str(" LIMIT ");
            out.push_str(&l);
        }
        if let Some(o) = &s.paging.offset {
            let o = self.count(o, None);
            out.push_str(" OFFSET ");
            out.push_str(&o);
        }
        Ok(out)
    }

    fn count(&mut self, c: &Count, cap: Option<u32>) -> String {
        match (c, cap) {
            (Count::Num(n), _) => n.to_string(),
            (Count::Var(v), None) => self.param(v, "integer", false),
            (Count::Var(v), Some(max)) => format!("LEAST({}, {})", self.param(v, "integer", false), max),
        }
    }

    /// Parent columns joined on by the children of `s`.
    fn child_cols(&self, s: &Select) -> Vec<String> {
        let mut out = Vec::new();
        for &c in &s.children {
            let Some(rel) = &self.qc.selects[c].rel else { continue };
            if rel.typ == RelType::Recursive {
                out.push(rel.left.col.name.clone());
            }
            out.push(rel.right.col.name.clone());
            if let Some(p) = &rel.poly {
                out.push(p.type_col.name.clone());
            }
        }
        out
    }

    fn order_by(&mut self, s: &Select, alias: &str) -> String {
        let default;
        let list: &[OrderBy] = if s.order_by.is_empty() && s.rel_type() == Some(RelType::Recursive) {
            default = self
                .schema
                .table(s.tid)
                .primary()
                .map(|pk| {
                    vec![OrderBy {
                        col: pk.clone(),
                        order: Order::Asc,
                        var: None,
                    }]
                })
                .unwrap_or_default();
            &default
        } else {
            &s.order_by
        };

        let mut out = Vec::with_capacity(list.len());
        for o in list {
            let c = self.col(alias, &o.col.name);
            if let Some(var) = &o.var {
                let p = self.param(var, "text", false);
                out.push(format!("CASE WHEN {} = 'desc' THEN {} END DESC, {} ASC", p, c, c));
                continue;
            }
            let dir = if o.order.is_desc() { "DESC" } else { "ASC" };
            let nulls = match o.order {
                Order::AscNullsFirst | Order::DescNullsFirst => Some(true),
                Order::AscNullsLast | Order::DescNullsLast => Some(false),
                _ => None,
            };
            match (self.d.is_mysql(), nulls) {
                (_, None) => out.push(format!("{} {}", c, dir)),
                (false, Some(first)) => out.push(format!(
                    "{} {} NULLS {}",
                    c,
                    dir,
                    if first { "FIRST" } else { "LAST" }
                )),
                (true, Some(first)) => {
                    out.push(format!("{} IS NULL {}", c, if first { "DESC" } else { "ASC" }));
                    out.push(format!("{} {}", c, dir));
                }
            }
        }
        out.join(", ")
    }

    fn search_rank(&mut self, s: &Select, alias: &str) -> Result<String, RenderError> {
        let Some(val) = &s.search else {
            return Err(RenderError::Unsupported("search_rank without search".into()));
        };
        let cols: Vec<_> = self
            .schema
            .table(s.tid)
            .full_text()
            .map(|c| ColRef::new(alias, c))
            .collect();
        let Some(first) = cols.first() else {
            return Err(RenderError::Unsupported(format!("no full text columns on '{}'", s.table)));
        };
        if self.d.is_mysql() {
            return self.search(&cols, val, Remap::none());
        }
        let tsv = self.tsvector(first, Remap::none());
        let q = match val {
            Val::Var(v) => self.param(v, "text", false),
            Val::Str(t) => self.lit(t),
            v => return Err(RenderError::Unsupported(format!("search on {:?}", v))),
        };
        Ok(format!("ts_rank({}, websearch_to_tsquery({}))", tsv, q))
    }

    /// Rows of a json column, typed after the configured columns.
    fn embedded_source(&self, s: &Select, rel: &DBRel, alias: &str) -> Result<String, RenderError> {
        if self.d.is_mysql() {
            return Err(RenderError::Unsupported("json tables on mysql".into()));
        }
        let parent = self.join_alias(s).ok_or(RenderError::SelectMissing(s.id))?;
        let t = self.schema.table(s.tid);
        if t.typ != TableType::Json {
            return Err(RenderError::Unsupported(format!("'{}' is not a json table", t.name)));
        }
        let prefix = if rel.right.col.typ == "json" { "json" } else { "jsonb" };
        let func = if s.singular { "to_record" } else { "to_recordset" };
        let defs: Vec<String> = t
            .columns
            .iter()
            .map(|c| format!("{} {}{}", self.q(&c.name), c.typ, if c.array { "[]" } else { "" }))
            .collect();
        Ok(format!(
            "{}_{}({}) AS {}({})",
            prefix,
            func,
            self.col(&parent, &rel.right.col.name),
            self.q(alias),
            defs.join(", ")
        ))
    }

    /// Keys of every row reachable from the parent row, walking
    /// `left -> right` links. Cycles stop at the first repeated key.
    fn recursive_cte(&mut self, s: &Select, rel: &DBRel) -> Result<String, RenderError> {
        let parent = self.join_alias(s).ok_or(RenderError::SelectMissing(s.id))?;
        let t = self.table(&s.schema, &s.table);
        let rc = format!("__rc_{}", s.id);
        let cte = self.q(&format!("__rcte_{}", s.id));
        let r = self.q("__r");
        let (cl, cr) = (self.col(&rc, &rel.left.col.name), self.col(&rc, &rel.right.col.name));
        let (pl, pr) = (self.col(&parent, &rel.left.col.name), self.col(&parent, &rel.right.col.name));
        let next_ref = format!("{}.{}", r, self.q("__next"));
        let path_ref = format!("{}.{}", r, self.q("__path"));

        let find = s.find.unwrap_or(Find::Children);
        let (anchor, next, step) = match find {
            Find::Children => (format!("{} = {}", cl, pr), cr.clone(), format!("{} = {}", cl, next_ref)),
            Find::Parents => (format!("{} = {}", cr, pl), cl.clone(), format!("{} = {}", cr, next_ref)),
        };

        let (path0, path_step, guard) = if self.d.is_mysql() {
            (
                format!("CAST(CONCAT(',', {}, ',', {}, ',') AS CHAR(4000))", pr, cr),
                format!("CONCAT({}, {}, ',')", path_ref, cr),
                format!("LOCATE(CONCAT(',', {}, ','), {}) = 0", cr, path_ref),
            )
        } else {
            (
                format!("ARRAY[{}, {}]", pr, cr),
                format!("{} || {}", path_ref, cr),
                format!("NOT ({} = ANY({}))", cr, path_ref),
            )
        };

        let qrc = self.q(&rc);
        Ok(format!(
            "WITH RECURSIVE {}({}, {}, {}) AS (\
             SELECT {}, {}, {} FROM {} AS {} WHERE {} AND {} <> {} \
             UNION ALL \
             SELECT {}, {}, {} FROM {} AS {}, {} AS {} WHERE {} AND {})",
            cte,
            self.q("__key"),
            self.q("__next"),
            self.q("__path"),
            cr,
            next,
            path0,
            t,
            qrc,
            anchor,
            cr,
            pr,
            cr,
            next,
            path_step,
            t,
            qrc,
            cte,
            r,
            step,
            guard
        ))
    }
}

/// Output column: expression, name and whether it aggregates.
type Column = (String, String, bool);

fn push_col(cols: &mut Vec<Column>, expr: String, name: String, agg: bool) {
    if !cols.iter().any(|(_, n, _)| *n == name) {
        cols.push((expr, name, agg));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};

    use super::super::tests::{render, render_with};
    use super::super::Renderer;
    use crate::config::Config;
    use crate::qcode::tests::{compiler, open_config};
    use crate::sql::Dialect;

    #[test]
    fn test_plural_select_shape() {
        let st = render("{ products(limit: 2, order_by: { price: desc_nulls_last }) { id name } }");
        assert_eq!(
            st.sql,
            "SELECT jsonb_build_object('products', \"__sj_0\".\"json\") AS \"__root\" FROM (\
             SELECT coalesce(jsonb_agg(\"__sr_0\".\"json\"), '[]') AS \"json\" FROM (\
             SELECT jsonb_build_object('id', \"products\".\"id\", 'name', \"products\".\"name\") AS \"json\" \
             FROM (SELECT \"products\".\"id\" AS \"id\", \"products\".\"name\" AS \"name\", \"products\".\"price\" AS \"price\" \
             FROM \"public\".\"products\" AS \"products\" ORDER BY \"products\".\"price\" DESC NULLS LAST LIMIT 2) AS \"products\" \
             ORDER BY \"products\".\"price\" DESC NULLS LAST) AS \"__sr_0\") AS \"__sj_0\""
        );
    }

    #[test]
    fn test_singular_root_is_inline() {
        let st = render("{ product(id: 3) { id } }");
        assert!(st.sql.starts_with("SELECT jsonb_build_object('product', (SELECT jsonb_build_object('id'"));
        assert!(st.sql.contains("WHERE (\"products\".\"id\" = 3) LIMIT 1"));
        assert!(!st.sql.contains("__sj_0"));
    }

    #[test]
    fn test_many_to_many_through_join_table() {
        let st = render("{ products { id customers { email } } }");
        assert!(st.sql.contains(
            "FROM \"public\".\"customers\" AS \"customers\" INNER JOIN \"public\".\"purchases\" \
             ON (\"purchases\".\"customer_id\" = \"customers\".\"id\") \
             WHERE (\"purchases\".\"product_id\" = \"products\".\"id\")"
        ));
    }

    #[test]
    fn test_recursive_children() {
        let st = render(r#"{ comments(id: 95) { id replies: comments(find: "children") { id body } } }"#);
        let sql = &st.sql;
        assert!(sql.contains(
            "WITH RECURSIVE \"__rcte_1\"(\"__key\", \"__next\", \"__path\") AS (\
             SELECT \"__rc_1\".\"id\", \"__rc_1\".\"id\", ARRAY[\"comments\".\"id\", \"__rc_1\".\"id\"] \
             FROM \"public\".\"comments\" AS \"__rc_1\" \
             WHERE \"__rc_1\".\"reply_to_id\" = \"comments\".\"id\" AND \"__rc_1\".\"id\" <> \"comments\".\"id\""
        ));
        assert!(sql.contains("NOT (\"__rc_1\".\"id\" = ANY(\"__r\".\"__path\"))"));
        assert!(sql.contains(
            "FROM \"public\".\"comments\" AS \"comments__1\" \
             WHERE \"comments__1\".\"id\" IN (SELECT \"__key\" FROM \"__rcte_1\") \
             ORDER BY \"comments__1\".\"id\" ASC"
        ));
        // the parent projects the key the anchor reads
        assert!(sql.contains("\"comments\".\"reply_to_id\" AS \"reply_to_id\""));
        assert!(sql.contains("'replies', \"__sj_1\".\"json\""));
    }

    #[test]
    fn test_recursive_parents() {
        let st = render(r#"{ comment(id: 5) { id thread: comments(find: "parents") { id } } }"#);
        assert!(st.sql.contains(
            "WHERE \"__rc_1\".\"id\" = \"comments\".\"reply_to_id\" AND \"__rc_1\".\"id\" <> \"comments\".\"id\""
        ));
        assert!(st.sql.contains("WHERE \"__rc_1\".\"id\" = \"__r\".\"__next\""));
    }

    #[test]
    fn test_cursor_paging() {
        let st = render("{ products(first: 10, after: $cursor, order_by: { price: desc }) { id name } }");
        let sql = &st.sql;
        assert!(sql.starts_with(
            "WITH \"__cur_0\" AS (SELECT (($1 :: jsonb) ->> 0) :: numeric AS \"price\", \
             (($1 :: jsonb) ->> 1) :: bigint AS \"id\" WHERE $1 :: jsonb IS NOT NULL) SELECT"
        ));
        assert!(sql.contains("'products_cursor', \"__sj_0\".\"__cursor\""));
        assert!(sql.contains("jsonb_build_array(\"products\".\"price\", \"products\".\"id\") AS \"__cursor\""));
        assert!(sql.contains("(jsonb_agg(\"__sr_0\".\"__cursor\") -> -1) :: text AS \"__cursor\""));
        assert!(sql.contains(
            "WHERE (NOT EXISTS (SELECT 1 FROM \"__cur_0\") OR ((\"products\".\"price\" < (SELECT \"price\" FROM \"__cur_0\")) OR \
             ((\"products\".\"price\" = (SELECT \"price\" FROM \"__cur_0\")) AND (\"products\".\"id\" > (SELECT \"id\" FROM \"__cur_0\")))))"
        ));
        assert!(sql.contains("LIMIT 10"));
        assert_eq!(st.meta.params()[0].name, "cursor");
    }

    #[test]
    fn test_polymorphic_union() {
        let conf = Config {
            default_block: false,
            ..Config::from_json(
                r#"{ "tables": [{ "name": "subject", "table": "notifications", "type": "polymorphic",
                    "type_column": "subject_type", "id_column": "subject_id" }] }"#,
            )
            .unwrap()
        };
        let st = render_with(
            &compiler(&conf),
            "{ notifications { id subject { ...on users { email } ...on products { name } } } }",
            json!({}),
            "user",
        );
        let sql = &st.sql;
        assert!(sql.contains("SELECT coalesce((SELECT jsonb_build_object('email'"));
        assert!(sql.contains(
            "WHERE (\"users\".\"id\" = \"notifications\".\"subject_id\") AND (\"notifications\".\"subject_type\" = 'users')"
        ));
        assert!(sql.contains("(\"notifications\".\"subject_type\" = 'products')"));
        assert!(sql.contains("\"notifications\".\"subject_type\" AS \"subject_type\""));
        assert_eq!(sql.matches("LATERAL").count(), 1);
    }

    #[test]
    fn test_embedded_json_table() {
        let conf = Config {
            default_block: false,
            ..Config::from_json(
                r#"{ "tables": [{ "name": "meta", "table": "products", "type": "json",
                    "columns": [{ "name": "color" }, { "name": "size", "type": "integer" }] }] }"#,
            )
            .unwrap()
        };
        let st = render_with(&compiler(&conf), "{ products { id meta { color size } } }", json!({}), "user");
        assert!(st.sql.contains(
            "FROM jsonb_to_record(\"products\".\"meta\") AS \"meta\"(\"color\" text, \"size\" integer) LIMIT 1"
        ));
        assert!(st.sql.contains("\"products\".\"meta\" AS \"meta\""));
    }

    #[test]
    fn test_aggregates_group_by() {
        let st = render("{ products { owner_id count_id max_price upcase_name } }");
        assert!(st.sql.contains("count(\"products\".\"id\") AS \"count_id\""));
        assert!(st.sql.contains("max(\"products\".\"price\") AS \"max_price\""));
        assert!(st.sql.contains("\"upcase\"(\"products\".\"name\") AS \"upcase_name\""));
        assert!(st.sql.contains("GROUP BY \"products\".\"owner_id\", \"upcase\"(\"products\".\"name\")"));
    }

    #[test]
    fn test_search_and_rank() {
        let st = render("{ products(search: $q) { id search_rank } }");
        assert!(st.sql.contains("ts_rank(\"products\".\"tsv\", websearch_to_tsquery($1 :: text)) AS \"search_rank\""));
        assert!(st.sql.contains("(\"products\".\"tsv\" @@ websearch_to_tsquery($1 :: text))"));
        assert_eq!(st.meta.params().len(), 1);
    }

    #[test]
    fn test_variable_order_and_capped_limit() {
        let conf = Config::from_json(
            r#"{ "roles": [{ "name": "user", "tables": [{ "name": "products", "query": { "limit": 5 } }] }] }"#,
        )
        .unwrap();
        let st = render_with(
            &compiler(&conf),
            "{ products(order_by: { price: $dir }, limit: $n) { id } }",
            json!({}),
            "user",
        );
        assert!(st.sql.contains(
            "ORDER BY CASE WHEN $1 :: text = 'desc' THEN \"products\".\"price\" END DESC, \"products\".\"price\" ASC"
        ));
        assert!(st.sql.contains("LIMIT LEAST($2 :: integer, 5)"));
    }

    #[test]
    fn test_include_directive() {
        let st = render("{ products { id name @include(if: $full) } }");
        assert!(st.sql.contains("'name', (CASE WHEN $1 :: boolean THEN \"products\".\"name\" ELSE NULL END)"));
        let st = render("{ products { id name @skip(if: $short) } }");
        assert!(st.sql.contains("'name', (CASE WHEN $1 :: boolean THEN NULL ELSE \"products\".\"name\" END)"));
    }

    #[test]
    fn test_typename_and_distinct() {
        let st = render("{ products(distinct_on: [name]) { __typename name } }");
        assert!(st.sql.contains("'__typename', 'products'"));
        assert!(st.sql.contains("SELECT DISTINCT ON (\"products\".\"name\") "));
    }

    #[test]
    fn test_mysql_limits() {
        let c = compiler(&open_config());
        let r = Renderer::new(Dialect::MySQL, HashMap::new());
        let qc = c
            .compile("{ products(first: 2, after: $c) { id } }", &Map::new(), "user")
            .unwrap();
        assert!(r.render(&qc, c.schema()).is_err());

        let qc = c
            .compile("{ products(order_by: { price: asc_nulls_last }) { id } }", &Map::new(), "user")
            .unwrap();
        let st = r.render(&qc, c.schema()).unwrap();
        assert!(st.sql.contains("`products`.`price` IS NULL ASC, `products`.`price` ASC"));
    }
}
