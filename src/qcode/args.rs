//! Select arguments: `id`, `where`, ordering, paging, `search`, `find`.

use crate::ast::{Arg, Node};
use crate::schema::RelType;

use super::exp::{ColRef, Exp, Filter, FilterCompiler, Op, coerce};
use super::{CompileError, Count, Ctx, Find, Order, OrderBy, PagingType, QType, USER_VARS, Val};

/// Handled by the mutation planner.
const MUTATION_ARGS: [&str; 6] = ["insert", "update", "upsert", "delete", "connect", "disconnect"];

impl Ctx<'_> {
    /// Apply the arguments of field `fid` to select `id`. Returns the
    /// filter built from `id` and `where`.
    pub(super) fn select_args(&mut self, id: usize, fid: usize) -> Result<Option<Filter>, CompileError> {
        let op = self.op;
        let f = &op.fields[fid];
        let mut filters: Vec<Exp> = Vec::new();
        let mut needs_user = false;

        for a in &f.args {
            match a.name.as_str() {
                "id" => {
                    let (exp, user) = self.id_filter(id, a)?;
                    needs_user |= user;
                    filters.push(exp);
                    self.qc.selects[id].singular = true;
                }
                "where" => {
                    let (tid, table) = {
                        let s = &self.qc.selects[id];
                        (s.tid, s.table.clone())
                    };
                    let flt = FilterCompiler {
                        schema: self.schema,
                        camelcase: self.conf.enable_camelcase,
                        aliases: &mut self.aliases,
                    }
                    .compile(&a.val, tid, &table)?;
                    needs_user |= flt.needs_user;
                    filters.push(flt.exp);
                }
                "limit" => self.qc.selects[id].paging.limit = Some(count(f.key(), a)?),
                "offset" => self.qc.selects[id].paging.offset = Some(count(f.key(), a)?),
                "first" | "last" => {
                    let p = &mut self.qc.selects[id].paging;
                    p.limit = Some(count(f.key(), a)?);
                    p.typ = if a.name == "first" {
                        PagingType::Forward
                    } else {
                        PagingType::Backward
                    };
                }
                "after" | "before" => {
                    let Node::Var(v) = &a.val else {
                        return Err(CompileError::arg(f.key(), &a.name, "expects a cursor variable"));
                    };
                    let p = &mut self.qc.selects[id].paging;
                    p.cursor = Some(v.clone());
                    if p.typ == PagingType::Offset {
                        p.typ = if a.name == "after" {
                            PagingType::Forward
                        } else {
                            PagingType::Backward
                        };
                    }
                }
                "order_by" => self.order_by(id, f.key(), a)?,
                "distinct_on" => self.distinct_on(id, f.key(), a)?,
                "search" => {
                    let v = match &a.val {
                        Node::Var(v) => Val::Var(v.clone()),
                        Node::Str(s) => Val::Str(s.clone()),
                        n => {
                            return Err(CompileError::arg(
                                f.key(),
                                "search",
                                format!("expects a string, found {}", n.kind()),
                            ));
                        }
                    };
                    self.qc.selects[id].search = Some(v);
                }
                "find" => {
                    let find = match a.val.as_text().as_deref() {
                        Some("children") => Find::Children,
                        Some("parents") | Some("parent") => Find::Parents,
                        _ => return Err(CompileError::arg(f.key(), "find", "expects children or parents")),
                    };
                    let sel = &mut self.qc.selects[id];
                    if sel.rel_type() != Some(RelType::Recursive) {
                        return Err(CompileError::arg(
                            f.key(),
                            "find",
                            "only valid on recursive relationships",
                        ));
                    }
                    sel.find = Some(find);
                }
                name if MUTATION_ARGS.contains(&name)
                    && self.qc.typ == QType::Mutation
                    && self.qc.selects[id].parent_id.is_none() => {}
                name => return Err(CompileError::arg(f.key(), name, "unknown argument")),
            }
        }

        Ok(Exp::all(filters).map(|exp| Filter { exp, needs_user }))
    }

    fn id_filter(&self, id: usize, a: &Arg) -> Result<(Exp, bool), CompileError> {
        let sel = &self.qc.selects[id];
        let t = self.schema.table(sel.tid);
        let pk = t
            .primary()
            .ok_or_else(|| CompileError::NoPrimaryKey(t.name.clone()))?;
        let user = matches!(&a.val, Node::Var(v) if USER_VARS.contains(&v.as_str()));
        Ok((
            Exp::op(Op::Eq, ColRef::new(&sel.table, pk), coerce(pk, &a.val)?),
            user,
        ))
    }

    fn order_by(&mut self, id: usize, field: &str, a: &Arg) -> Result<(), CompileError> {
        let items: Vec<&(String, Node)> = match &a.val {
            Node::Obj(items) => items.iter().collect(),
            Node::List(list) => {
                let mut items = Vec::new();
                for n in list {
                    let Node::Obj(o) = n else {
                        return Err(CompileError::arg(field, "order_by", "expects a list of objects"));
                    };
                    items.extend(o.iter());
                }
                items
            }
            n => {
                return Err(CompileError::arg(
                    field,
                    "order_by",
                    format!("expects an object, found {}", n.kind()),
                ));
            }
        };

        let tid = self.qc.selects[id].tid;
        let t = self.schema.table(tid);
        let mut out = Vec::with_capacity(items.len());
        for (k, v) in items {
            let name = self.field_name(k);
            let col = t.get_column(&name)?;
            let (order, var) = match v {
                Node::Var(var) => (Order::Asc, Some(var.clone())),
                v => {
                    let o = v.as_text().as_deref().and_then(Order::parse).ok_or_else(|| {
                        CompileError::arg(field, "order_by", format!("invalid order for '{}'", k))
                    })?;
                    (o, None)
                }
            };
            out.push(OrderBy {
                col: col.clone(),
                order,
                var,
            });
        }
        self.qc.selects[id].order_by = out;
        Ok(())
    }

    fn distinct_on(&mut self, id: usize, field: &str, a: &Arg) -> Result<(), CompileError> {
        let names: Vec<&Node> = match &a.val {
            Node::List(list) => list.iter().collect(),
            n => vec![n],
        };
        let t = self.schema.table(self.qc.selects[id].tid);
        let mut cols = Vec::with_capacity(names.len());
        for n in names {
            let name = n
                .as_text()
                .ok_or_else(|| CompileError::arg(field, "distinct_on", "expects column names"))?;
            cols.push(t.get_column(&self.field_name(&name))?.clone());
        }
        self.qc.selects[id].distinct_on = cols;
        Ok(())
    }
}

fn count(field: &str, a: &Arg) -> Result<Count, CompileError> {
    match &a.val {
        Node::Int(n) if *n >= 0 => Ok(Count::Num(u32::try_from(*n).unwrap_or(u32::MAX))),
        Node::Var(v) => Ok(Count::Var(v.clone())),
        n => Err(CompileError::arg(
            field,
            &a.name,
            format!("expects a positive integer, found {}", n.kind()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::super::tests::{compiler, open_config};
    use super::super::*;

    fn compile(query: &str) -> Result<QCode, CompileError> {
        compiler(&open_config()).compile(query, &Map::new(), "user")
    }

    #[test]
    fn test_order_by_forms() {
        let qc = compile("{ products(order_by: { price: desc_nulls_last, id: asc }) { id } }").unwrap();
        let ob = &qc.selects[0].order_by;
        assert_eq!(ob[0].col.name, "price");
        assert_eq!(ob[0].order, Order::DescNullsLast);
        assert_eq!(ob[1].order, Order::Asc);

        let qc = compile("{ products(order_by: [{ name: asc }, { price: $dir }]) { id } }").unwrap();
        let ob = &qc.selects[0].order_by;
        assert_eq!(ob[1].var.as_deref(), Some("dir"));

        assert!(compile("{ products(order_by: { price: sideways }) { id } }").is_err());
        assert!(compile("{ products(order_by: { nope: asc }) { id } }").is_err());
    }

    #[test]
    fn test_paging_args() {
        let qc = compile("{ products(limit: $limit, offset: 10, distinct_on: [name]) { id } }").unwrap();
        let sel = &qc.selects[0];
        assert_eq!(sel.paging.limit, Some(Count::Var("limit".into())));
        assert_eq!(sel.paging.offset, Some(Count::Num(10)));
        assert_eq!(sel.distinct_on[0].name, "name");

        assert!(compile("{ products(limit: -1) { id } }").is_err());
        assert!(compile(r#"{ products(first: 2, after: "abc") { id } }"#).is_err());
    }

    #[test]
    fn test_search() {
        let qc = compile("{ products(search: $q) { id search_rank } }").unwrap();
        let sel = &qc.selects[0];
        assert_eq!(sel.search, Some(Val::Var("q".into())));
        assert!(matches!(sel.filter, Some(Exp::Search { .. })));
        assert_eq!(sel.fields[1].kind, FieldKind::SearchRank);

        assert!(compile("{ users(search: $q) { id } }").is_err());
        assert!(compile("{ products { search_rank } }").is_err());
    }

    #[test]
    fn test_find_only_on_recursive() {
        assert!(compile(r#"{ users { products(find: "children") { id } } }"#).is_err());
    }

    #[test]
    fn test_unknown_argument() {
        assert!(matches!(
            compile("{ products(sort: 1) { id } }"),
            Err(CompileError::InvalidArg { .. })
        ));
        assert!(compile("{ products(insert: $data) { id } }").is_err());
    }
}
