//! Mutation planning.
//!
//! The input variable of an insert or update is walked with an explicit
//! stack. Every key is either a column of the current table, a nested
//! write into a related table, or a `connect`/`disconnect` against one.
//! Each write becomes one [`Mutate`] step rendered as a CTE. Steps are
//! ordered so a row exists before anything referencing its key is
//! written: a child holding the foreign key runs after its parent, a
//! parent holding the foreign key runs after its child.

use std::collections::HashSet;

use serde_json::Value;

use crate::ast::Node;
use crate::schema::{DBColumn, DBRel, RelType, SchemaError};

use super::exp::{ColRef, Exp, FilterCompiler, Op, coerce};
use super::roles::{MutationKind, MutationPerms, Preset};
use super::{CompileError, Ctx, PermissionError, USER_VARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateKind {
    Insert,
    Update,
    Upsert,
    Delete,
    /// Point the child's foreign key at the parent
    Connect,
    /// Clear the child's foreign key
    Disconnect,
    /// Row looked up to connect to a parent that holds the foreign key
    Lookup,
}

/// `col = (SELECT from_col FROM <cte of step from>)`
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub col: DBColumn,
    pub from: usize,
    pub from_col: DBColumn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mutate {
    pub id: usize,
    pub kind: MutateKind,
    pub tid: usize,
    pub schema: String,
    pub table: String,
    /// Name of the CTE holding the written rows
    pub cte: String,
    /// JSON keys leading from the variable to this step's input
    pub path: Vec<String>,
    /// Input is a list of rows
    pub array: bool,
    pub cols: Vec<DBColumn>,
    pub presets: Vec<(DBColumn, Preset)>,
    /// Columns set to `NULL`
    pub nulls: Vec<DBColumn>,
    /// Columns filled from an earlier step
    pub links: Vec<Link>,
    /// Restricts the rows to those related to an earlier step
    pub join: Option<Link>,
    /// Key columns of a connect or disconnect, with a flag for list values
    pub keys: Vec<(DBColumn, bool)>,
    pub filter: Option<Exp>,
    /// Upsert conflict target
    pub conflict: Option<DBColumn>,
    rank: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    /// Variable holding the input
    pub var: Option<String>,
    /// Steps in execution order
    pub items: Vec<Mutate>,
}

impl Mutation {
    pub fn root(&self) -> Option<&Mutate> {
        self.items.iter().find(|m| m.id == 0)
    }

    pub fn item(&self, id: usize) -> Option<&Mutate> {
        self.items.iter().find(|m| m.id == id)
    }
}

struct Work<'v> {
    item: usize,
    val: &'v Value,
}

impl Ctx<'_> {
    pub(super) fn mutation_roots(&mut self) -> Result<(), CompileError> {
        let op = self.op;
        let mut planned = false;

        for &fid in &op.roots {
            let f = &op.fields[fid];
            let kinds: Vec<MutationKind> = [
                ("insert", MutationKind::Insert),
                ("update", MutationKind::Update),
                ("upsert", MutationKind::Upsert),
                ("delete", MutationKind::Delete),
            ]
            .into_iter()
            .filter(|(n, _)| f.arg(n).is_some())
            .map(|(_, k)| k)
            .collect();

            let Some(id) = self.root_select(fid)? else { continue };
            self.qc.roots.push(id);
            self.qc.selects[id].paging.no_limit = true;

            match kinds.as_slice() {
                [] => continue,
                [kind] if !planned => {
                    let m = self.plan(id, fid, *kind)?;
                    self.qc.mutation = Some(m);
                    planned = true;
                }
                [_] => {
                    return Err(CompileError::Unsupported("more than one mutation per request".into()));
                }
                _ => {
                    return Err(CompileError::arg(
                        f.key(),
                        "insert",
                        "only one of insert, update, upsert or delete may be used",
                    ));
                }
            }
        }

        if !planned {
            return Err(CompileError::Unsupported("mutation without insert, update, upsert or delete".into()));
        }
        Ok(())
    }

    fn plan(&mut self, sel: usize, fid: usize, kind: MutationKind) -> Result<Mutation, CompileError> {
        let op = self.op;
        let f = &op.fields[fid];
        let tid = self.qc.selects[sel].tid;
        let arg = |n: &str| f.arg(n).map(|a| &a.val);

        let mut m = Mutation {
            kind,
            var: None,
            items: Vec::new(),
        };

        let root_kind = match kind {
            MutationKind::Insert => MutateKind::Insert,
            MutationKind::Update => MutateKind::Update,
            MutationKind::Upsert => MutateKind::Upsert,
            MutationKind::Delete => MutateKind::Delete,
        };
        let root = self.new_item(&mut m, root_kind, tid, Vec::new(), 0)?;

        if kind == MutationKind::Update || kind == MutationKind::Delete {
            let mut filters = Vec::new();
            let table = m.items[root].table.clone();
            if let Some(idv) = arg("id") {
                let t = self.schema.table(tid);
                let pk = t
                    .primary()
                    .ok_or_else(|| CompileError::NoPrimaryKey(t.name.clone()))?;
                self.check_user_var(idv)?;
                filters.push(Exp::op(Op::Eq, ColRef::new(&table, pk), coerce(pk, idv)?));
            }
            if let Some(w) = arg("where") {
                let flt = FilterCompiler {
                    schema: self.schema,
                    camelcase: self.conf.enable_camelcase,
                    aliases: &mut self.aliases,
                }
                .compile(w, tid, &table)?;
                if flt.needs_user && self.role.is_anon() {
                    return Err(PermissionError::RequiredVar(USER_VARS[0].to_string()).into());
                }
                filters.push(flt.exp);
            }
            if filters.is_empty() {
                return Err(CompileError::arg(f.key(), &kind.to_string(), "needs an id or where argument"));
            }
            m.items[root].filter = Exp::and(Exp::all(filters), m.items[root].filter.take());
        }

        if kind == MutationKind::Delete {
            m.items[root].cte = m.items[root].table.clone();
            return Ok(m);
        }

        let Some(Node::Var(var)) = arg(&kind.to_string()) else {
            return Err(CompileError::arg(f.key(), &kind.to_string(), "expects a variable"));
        };
        let vars = self.vars;
        let data = vars
            .get(var)
            .filter(|v| v.is_object() || v.is_array())
            .ok_or_else(|| CompileError::MissingVar(var.clone()))?;
        m.var = Some(var.clone());

        let mut st = vec![Work {
            item: root,
            val: data,
        }];
        while let Some(w) = st.pop() {
            self.plan_item(&mut m, w, &mut st)?;
        }

        if kind == MutationKind::Upsert {
            self.conflict_target(&mut m.items[root])?;
        }

        // stable, so siblings keep their discovery order
        m.items.sort_by_key(|i| i.rank);
        let mut used = HashSet::from([self.schema.table(tid).name.clone()]);
        for i in m.items.iter_mut() {
            i.cte = if i.id == root || used.insert(i.table.clone()) {
                i.table.clone()
            } else {
                format!("{}_{}", i.table, i.id)
            };
        }
        Ok(m)
    }

    fn new_item(
        &self,
        m: &mut Mutation,
        kind: MutateKind,
        tid: usize,
        path: Vec<String>,
        rank: i32,
    ) -> Result<usize, CompileError> {
        let t = self.schema.table(tid);
        let id = m.items.len();
        let mut item = Mutate {
            id,
            kind,
            tid,
            schema: t.schema.clone(),
            table: t.name.clone(),
            cte: String::new(),
            path,
            array: false,
            cols: Vec::new(),
            presets: Vec::new(),
            nulls: Vec::new(),
            links: Vec::new(),
            join: None,
            keys: Vec::new(),
            filter: None,
            conflict: None,
            rank,
        };

        match kind {
            MutateKind::Lookup => {
                let blocked = match self.roles.table(self.role, &t.name) {
                    Some(tp) => tp.query.as_ref().is_some_and(|q| q.block),
                    None => self.roles.default_blocked(self.role),
                };
                if blocked {
                    return Err(self.op_blocked("connect", &t.name));
                }
            }
            _ => {
                let perm_kind = match kind {
                    MutateKind::Insert => MutationKind::Insert,
                    MutateKind::Upsert => MutationKind::Upsert,
                    MutateKind::Delete => MutationKind::Delete,
                    _ => MutationKind::Update,
                };
                let perms = self
                    .roles
                    .table(self.role, &t.name)
                    .and_then(|tp| tp.mutation(perm_kind))
                    .filter(|p| !p.block)
                    .ok_or_else(|| self.op_blocked(&perm_kind.to_string(), &t.name))?;
                self.apply_perms(&mut item, perms, perm_kind)?;
            }
        }

        m.items.push(item);
        Ok(id)
    }

    fn op_blocked(&self, op: &str, table: &str) -> CompileError {
        PermissionError::OpBlocked {
            op: op.to_string(),
            table: table.to_string(),
            role: self.role_name.to_string(),
        }
        .into()
    }

    fn check_user_var(&self, n: &Node) -> Result<(), CompileError> {
        if let Node::Var(v) = n {
            if self.role.is_anon() && USER_VARS.contains(&v.as_str()) {
                return Err(PermissionError::RequiredVar(v.clone()).into());
            }
        }
        Ok(())
    }

    /// Presets and mandatory filters of the role.
    fn apply_perms(
        &self,
        item: &mut Mutate,
        perms: &MutationPerms,
        kind: MutationKind,
    ) -> Result<(), CompileError> {
        let t = self.schema.table(item.tid);

        if matches!(kind, MutationKind::Insert | MutationKind::Update | MutationKind::Upsert) {
            for (name, p) in &perms.presets {
                let col = t.get_column(name)?;
                if let Preset::Var(v) = p {
                    if self.role.is_anon() && USER_VARS.contains(&v.as_str()) {
                        return Err(PermissionError::RequiredVar(v.clone()).into());
                    }
                }
                item.presets.push((col.clone(), p.clone()));
            }
        }

        if matches!(kind, MutationKind::Update | MutationKind::Delete | MutationKind::Upsert) {
            let mut aliases = 0;
            let mut filters = Vec::with_capacity(perms.filters.len());
            for node in &perms.filters {
                let flt = FilterCompiler {
                    schema: self.schema,
                    camelcase: false,
                    aliases: &mut aliases,
                }
                .compile(node, item.tid, &t.name)?;
                if flt.needs_user && self.role.is_anon() {
                    return Err(PermissionError::RequiredVar(USER_VARS[0].to_string()).into());
                }
                filters.push(flt.exp);
            }
            item.filter = Exp::all(filters);
        }
        Ok(())
    }

    fn plan_item<'v>(
        &mut self,
        m: &mut Mutation,
        w: Work<'v>,
        st: &mut Vec<Work<'v>>,
    ) -> Result<(), CompileError> {
        let (rows, array): (Vec<&'v serde_json::Map<String, Value>>, bool) = match w.val {
            Value::Object(o) => (vec![o], false),
            Value::Array(list) => {
                let rows = list
                    .iter()
                    .map(|v| {
                        v.as_object().ok_or_else(|| {
                            CompileError::InvalidValue {
                                col: m.items[w.item].table.clone(),
                                msg: "expecting a list of objects".into(),
                            }
                        })
                    })
                    .collect::<Result<_, _>>()?;
                (rows, true)
            }
            _ => {
                return Err(CompileError::InvalidValue {
                    col: m.items[w.item].table.clone(),
                    msg: "expecting an object or a list of objects".into(),
                });
            }
        };
        m.items[w.item].array = array;

        let tid = m.items[w.item].tid;
        let kind = m.items[w.item].kind;
        let mut seen = HashSet::new();

        for row in rows {
            for (k, v) in row {
                let name = self.field_name(k);
                if !seen.insert(name.clone()) {
                    continue;
                }
                let t = self.schema.table(tid);

                if let Some(col) = t.column(&name) {
                    self.check_column(m, w.item, col)?;
                    if !m.items[w.item].presets.iter().any(|(c, _)| c.name == col.name) {
                        m.items[w.item].cols.push(col.clone());
                    }
                    continue;
                }

                if array {
                    return Err(CompileError::Unsupported(format!(
                        "nested '{}' under a list of {}",
                        k, t.name
                    )));
                }
                let (cid, rel) = self.mutation_rel(tid, &name)?;
                let mut path = m.items[w.item].path.clone();
                path.push(k.clone());

                let ops = v.as_object().filter(|o| o.contains_key("connect") || o.contains_key("disconnect"));
                match ops {
                    Some(o) => {
                        for (opname, keys) in o {
                            let mut kpath = path.clone();
                            kpath.push(opname.clone());
                            match opname.as_str() {
                                "connect" => self.plan_connect(m, w.item, cid, &rel, kpath, keys, true)?,
                                "disconnect" => self.plan_connect(m, w.item, cid, &rel, kpath, keys, false)?,
                                other => {
                                    return Err(CompileError::Unsupported(format!(
                                        "'{}' next to connect or disconnect on '{}'",
                                        other, k
                                    )));
                                }
                            }
                        }
                    }
                    None => {
                        let parent_rank = m.items[w.item].rank;
                        let child = match kind {
                            MutateKind::Insert => {
                                if rel.child_holds_fk() {
                                    let c = self.new_item(m, MutateKind::Insert, cid, path, parent_rank + 1)?;
                                    m.items[c].links.push(Link {
                                        col: rel.left.col.clone(),
                                        from: w.item,
                                        from_col: rel.right.col.clone(),
                                    });
                                    c
                                } else {
                                    if v.is_array() {
                                        return Err(CompileError::Unsupported(format!(
                                            "a list for '{}', {} holds a single reference",
                                            k, t.name
                                        )));
                                    }
                                    let c = self.new_item(m, MutateKind::Insert, cid, path, parent_rank - 1)?;
                                    m.items[w.item].links.push(Link {
                                        col: rel.right.col.clone(),
                                        from: c,
                                        from_col: rel.left.col.clone(),
                                    });
                                    c
                                }
                            }
                            MutateKind::Update => {
                                let c = self.new_item(m, MutateKind::Update, cid, path, parent_rank + 1)?;
                                m.items[c].join = Some(Link {
                                    col: rel.left.col.clone(),
                                    from: w.item,
                                    from_col: rel.right.col.clone(),
                                });
                                c
                            }
                            _ => {
                                return Err(CompileError::Unsupported(format!(
                                    "nested '{}' in an {}",
                                    k,
                                    m.kind
                                )));
                            }
                        };
                        st.push(Work { item: child, val: v });
                    }
                }
            }
        }
        Ok(())
    }

    /// Relationship used by a nested write under `parent`.
    fn mutation_rel(&self, parent: usize, name: &str) -> Result<(usize, DBRel), CompileError> {
        let (cid, rel) = match self.schema.rel_by_name(parent, name) {
            Some((cid, rel)) => (cid, rel.clone()),
            None => {
                let tr = self.schema.find(name).ok_or_else(|| {
                    SchemaError::ColumnNotFound(self.schema.table(parent).name.clone(), name.to_string())
                })?;
                (tr.id, self.schema.get_rel(tr.id, parent, None)?.clone())
            }
        };
        match rel.typ {
            RelType::OneToOne | RelType::OneToMany if rel.through.is_none() => Ok((cid, rel)),
            _ => Err(CompileError::Unsupported(format!(
                "nested writes through '{}' relationships",
                name
            ))),
        }
    }

    fn check_column(&self, m: &Mutation, item: usize, col: &DBColumn) -> Result<(), CompileError> {
        let it = &m.items[item];
        let kind = match it.kind {
            MutateKind::Insert => MutationKind::Insert,
            MutateKind::Upsert => MutationKind::Upsert,
            _ => MutationKind::Update,
        };
        let allowed = self
            .roles
            .table(self.role, &it.table)
            .and_then(|tp| tp.mutation(kind))
            .is_some_and(|p| p.allows(&col.name));
        if col.blocked || !allowed {
            return Err(PermissionError::ColumnBlocked {
                table: it.table.clone(),
                column: col.name.clone(),
                role: self.role_name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_connect(
        &self,
        m: &mut Mutation,
        parent: usize,
        cid: usize,
        rel: &DBRel,
        path: Vec<String>,
        keys: &Value,
        connect: bool,
    ) -> Result<(), CompileError> {
        let t = self.schema.table(cid);
        let Value::Object(ko) = keys else {
            return Err(CompileError::InvalidValue {
                col: t.name.clone(),
                msg: "connect and disconnect expect an object of key columns".into(),
            });
        };
        let mut kcols = Vec::with_capacity(ko.len());
        for (k, v) in ko {
            let col = t.get_column(&self.field_name(k))?;
            kcols.push((col.clone(), v.is_array()));
        }
        if kcols.is_empty() {
            return Err(CompileError::InvalidValue {
                col: t.name.clone(),
                msg: "no key columns given".into(),
            });
        }

        let rank = m.items[parent].rank;
        if rel.child_holds_fk() {
            let kind = if connect {
                MutateKind::Connect
            } else {
                MutateKind::Disconnect
            };
            let c = self.new_item(m, kind, cid, path, rank + 1)?;
            let link = Link {
                col: rel.left.col.clone(),
                from: parent,
                from_col: rel.right.col.clone(),
            };
            let item = &mut m.items[c];
            item.keys = kcols;
            item.presets.clear();
            if connect {
                item.links.push(link);
            } else {
                item.nulls.push(rel.left.col.clone());
                item.join = Some(link);
            }
        } else if connect {
            let c = self.new_item(m, MutateKind::Lookup, cid, path, rank - 1)?;
            m.items[c].keys = kcols;
            m.items[parent].links.push(Link {
                col: rel.right.col.clone(),
                from: c,
                from_col: rel.left.col.clone(),
            });
        } else {
            m.items[parent].nulls.push(rel.right.col.clone());
        }
        Ok(())
    }

    fn conflict_target(&self, item: &mut Mutate) -> Result<(), CompileError> {
        let t = self.schema.table(item.tid);
        let target = t
            .primary()
            .filter(|pk| item.cols.iter().any(|c| c.name == pk.name))
            .or_else(|| {
                item.cols
                    .iter()
                    .find(|c| c.unique_key)
                    .and_then(|c| t.column(&c.name))
            })
            .ok_or_else(|| {
                CompileError::Unsupported(format!(
                    "upsert into '{}' needs its primary key or a unique column",
                    t.name
                ))
            })?;
        item.conflict = Some(target.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::super::tests::compiler;
    use super::super::*;
    use super::*;
    use crate::config::Config;

    fn conf() -> Config {
        Config::from_json(
            r#"{ "roles": [
                { "name": "user", "tables": [
                    { "name": "users", "insert": {}, "update": { "filters": ["{ id: { eq: $user_id } }"] }, "upsert": {}, "delete": {} },
                    { "name": "products", "insert": { "presets": { "owner_id": "$user_id", "created_at": "sql:now()" } }, "update": {} },
                    { "name": "customers", "insert": {} },
                    { "name": "comments", "insert": {}, "update": {} }
                ] },
                { "name": "anon", "tables": [{ "name": "users", "insert": { "columns": ["email"] } }] }
            ] }"#,
        )
        .unwrap()
    }

    fn compile(q: &str, vars: Value, role: &str) -> Result<QCode, CompileError> {
        compiler(&conf()).compile(q, vars.as_object().unwrap_or(&Map::new()), role)
    }

    #[test]
    fn test_simple_insert() {
        let qc = compile(
            "mutation { users(insert: $data) { id email } }",
            json!({"data": {"id": 1001, "email": "a@b.com", "full_name": "A"}}),
            "user",
        )
        .unwrap();
        let m = qc.mutation.unwrap();
        assert_eq!(m.var.as_deref(), Some("data"));
        assert_eq!(m.items.len(), 1);
        let root = m.root().unwrap();
        assert_eq!(root.cte, "users");
        let cols: Vec<&str> = root.cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cols, vec!["email", "full_name", "id"]);
        assert!(qc.selects[0].paging.no_limit);
    }

    #[test]
    fn test_nested_insert_order() {
        // users are created first, products reference them
        let qc = compile(
            "mutation { users(insert: $data) { id } }",
            json!({"data": {"email": "a@b.com", "products": [{"name": "p1", "price": 1}]}}),
            "user",
        )
        .unwrap();
        let m = qc.mutation.unwrap();
        let order: Vec<&str> = m.items.iter().map(|i| i.table.as_str()).collect();
        assert_eq!(order, vec!["users", "products"]);
        let p = &m.items[1];
        assert!(p.array);
        assert_eq!(p.path, vec!["products"]);
        assert_eq!(p.links[0].col.name, "owner_id");
        // presets are kept next to links, the renderer lets presets win
        assert_eq!(p.presets.len(), 2);

        // the owner must exist before the product
        let qc = compile(
            "mutation { products(insert: $data) { id } }",
            json!({"data": {"name": "p", "owner": {"email": "o@b.com"}}}),
            "user",
        )
        .unwrap();
        let m = qc.mutation.unwrap();
        let order: Vec<&str> = m.items.iter().map(|i| i.table.as_str()).collect();
        assert_eq!(order, vec!["users", "products"]);
        assert_eq!(m.root().unwrap().links[0].col.name, "owner_id");
    }

    #[test]
    fn test_connect_and_disconnect() {
        let qc = compile(
            "mutation { products(insert: $data) { id } }",
            json!({"data": {"name": "p", "owner": {"connect": {"id": 5}}}}),
            "user",
        )
        .unwrap();
        let m = qc.mutation.unwrap();
        assert_eq!(m.items[0].kind, MutateKind::Lookup);
        assert_eq!(m.items[0].path, vec!["owner", "connect"]);

        let qc = compile(
            "mutation { users(update: $data, id: 1) { id } }",
            json!({"data": {"full_name": "B", "products": {"disconnect": {"id": [1, 2]}}}}),
            "user",
        )
        .unwrap();
        let m = qc.mutation.unwrap();
        let d = m.items.iter().find(|i| i.kind == MutateKind::Disconnect).unwrap();
        assert_eq!(d.nulls[0].name, "owner_id");
        assert!(d.keys[0].1);
    }

    #[test]
    fn test_update_needs_filter_and_applies_role_filter() {
        assert!(matches!(
            compile("mutation { users(update: $data) { id } }", json!({"data": {"email": "x"}}), "user"),
            Err(CompileError::InvalidArg { .. })
        ));

        let qc = compile(
            "mutation { users(update: $data, where: { email: { eq: \"a\" } }) { id } }",
            json!({"data": {"full_name": "x"}}),
            "user",
        )
        .unwrap();
        let Some(Exp::And(items)) = &qc.mutation.unwrap().items[0].filter else {
            panic!("expected combined filter");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_mutation_permissions() {
        assert!(matches!(
            compile("mutation { purchases(insert: $data) { id } }", json!({"data": {"quantity": 1}}), "user"),
            Err(CompileError::Permission(PermissionError::OpBlocked { .. }))
        ));
        assert!(matches!(
            compile("mutation { products(delete: true, id: 1) { id } }", json!({}), "user"),
            Err(CompileError::Permission(PermissionError::OpBlocked { .. }))
        ));
        assert!(matches!(
            compile("mutation { users(insert: $data) { id } }", json!({"data": {"email": "a", "password": "x"}}), "anon"),
            Err(CompileError::Permission(PermissionError::ColumnBlocked { .. }))
        ));
        assert!(matches!(
            compile("mutation { products(insert: $data) { id } }", json!({"data": {"name": "x"}}), "anon"),
            Err(CompileError::Permission(PermissionError::OpBlocked { .. }))
        ));
    }

    #[test]
    fn test_upsert_conflict_target() {
        let qc = compile(
            "mutation { users(upsert: $data) { id } }",
            json!({"data": {"email": "a@b.com", "full_name": "A"}}),
            "user",
        )
        .unwrap();
        assert_eq!(qc.mutation.unwrap().items[0].conflict.as_ref().unwrap().name, "email");
    }

    #[test]
    fn test_missing_variable() {
        assert!(matches!(
            compile("mutation { users(insert: $data) { id } }", json!({}), "user"),
            Err(CompileError::MissingVar(_))
        ));
    }

    #[test]
    fn test_nested_under_list_is_unsupported() {
        assert!(matches!(
            compile(
                "mutation { users(insert: $data) { id } }",
                json!({"data": [{"email": "a", "products": {"name": "p"}}]}),
                "user"
            ),
            Err(CompileError::Unsupported(_))
        ));
    }
}
