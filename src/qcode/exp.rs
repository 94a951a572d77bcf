//! Filter expressions.
//!
//! `where` arguments and role filters are compiled into an [`Exp`] tree.
//! The input object is walked with an explicit work list. Every node gets
//! a slot in a flat arena, parents before children, so the tree can be
//! assembled afterwards in a single reverse pass.

use crate::ast::Node;
use crate::schema::{DBColumn, DBRel, DBSchema, RelType, to_snake_case};

use super::{CompileError, USER_VARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
    Similar,
    NotSimilar,
    Regex,
    NotRegex,
    IRegex,
    NotIRegex,
    Contains,
    ContainedIn,
    HasKey,
    HasKeyAny,
    HasKeyAll,
    IsNull,
    /// `left = ANY(right)`, joins against array columns
    EqAny,
}

impl Op {
    pub fn parse(name: &str) -> Option<Op> {
        let op = match name {
            "eq" | "equals" => Op::Eq,
            "neq" | "not_equals" => Op::Neq,
            "gt" | "greater_than" => Op::Gt,
            "gte" | "greater_or_equals" => Op::Gte,
            "lt" | "lesser_than" => Op::Lt,
            "lte" | "lesser_or_equals" => Op::Lte,
            "in" => Op::In,
            "nin" | "not_in" => Op::NotIn,
            "like" => Op::Like,
            "nlike" | "not_like" => Op::NotLike,
            "ilike" => Op::ILike,
            "nilike" | "not_ilike" => Op::NotILike,
            "similar" => Op::Similar,
            "nsimilar" | "not_similar" => Op::NotSimilar,
            "regex" => Op::Regex,
            "nregex" | "not_regex" => Op::NotRegex,
            "iregex" => Op::IRegex,
            "niregex" | "not_iregex" => Op::NotIRegex,
            "contains" => Op::Contains,
            "contained_in" => Op::ContainedIn,
            "has_key" => Op::HasKey,
            "has_key_any" => Op::HasKeyAny,
            "has_key_all" => Op::HasKeyAll,
            "is_null" => Op::IsNull,
            _ => return None,
        };
        Some(op)
    }

    fn takes_list(self) -> bool {
        matches!(self, Op::In | Op::NotIn | Op::HasKeyAny | Op::HasKeyAll)
    }
}

/// Column reference qualified by a table name or alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ColRef {
    pub table: String,
    pub col: String,
    pub typ: String,
    pub array: bool,
}

impl ColRef {
    pub fn new(table: &str, col: &DBColumn) -> Self {
        Self {
            table: table.to_string(),
            col: col.name.clone(),
            typ: col.typ.clone(),
            array: col.array,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Str(String),
    Num(String),
    Bool(bool),
    Null,
    List(Vec<Val>),
    /// Bind parameter, typed after the column it is compared with
    Var(String),
    Col(ColRef),
    /// Trusted SQL from configuration
    Sql(String),
    /// Last seen value of `col` in the cursor of select `sel`
    Cursor { sel: usize, col: String },
}

/// A correlated table used by `EXISTS` filters on related tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub schema: String,
    pub table: String,
    pub alias: String,
    pub through: Option<ThroughJoin>,
    pub on: Exp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughJoin {
    pub schema: String,
    pub table: String,
    pub on: Exp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    True,
    False,
    And(Vec<Exp>),
    Or(Vec<Exp>),
    Not(Box<Exp>),
    Op { op: Op, left: ColRef, right: Val },
    Exists { join: Box<Join>, exp: Box<Exp> },
    /// Full text match over the table's search columns
    Search { cols: Vec<ColRef>, val: Val },
    /// No cursor was passed for select `n`
    CursorEmpty(usize),
}

impl Exp {
    pub fn op(op: Op, left: ColRef, right: Val) -> Self {
        Exp::Op { op, left, right }
    }

    /// `a AND b` where either side may be missing.
    pub fn and(a: Option<Exp>, b: Option<Exp>) -> Option<Exp> {
        match (a, b) {
            (Some(Exp::And(mut l)), Some(r)) => {
                l.push(r);
                Some(Exp::And(l))
            }
            (Some(l), Some(r)) => Some(Exp::And(vec![l, r])),
            (l, None) => l,
            (None, r) => r,
        }
    }

    /// Build an `AND` of all filters, `None` when empty.
    pub fn all(exps: Vec<Exp>) -> Option<Exp> {
        let mut exps = exps;
        match exps.len() {
            0 => None,
            1 => exps.pop(),
            _ => Some(Exp::And(exps)),
        }
    }
}

/// Join condition between a child and its parent.
/// Returns the condition on the parent and the join table, if any.
pub fn rel_join(rel: &DBRel, child: &str, parent: &str) -> (Exp, Option<ThroughJoin>) {
    match &rel.through {
        Some(th) => {
            let tj = ThroughJoin {
                schema: th.schema.clone(),
                table: th.table.clone(),
                on: col_eq(&th.table, &th.col_l, child, &rel.left.col),
            };
            (col_eq(&th.table, &th.col_r, parent, &rel.right.col), Some(tj))
        }
        None => (col_eq(child, &rel.left.col, parent, &rel.right.col), None),
    }
}

/// `a.x = b.y`, or `= ANY` when one of the two is an array.
pub fn col_eq(ta: &str, a: &DBColumn, tb: &str, b: &DBColumn) -> Exp {
    match (a.array, b.array) {
        (false, true) => Exp::op(Op::EqAny, ColRef::new(ta, a), Val::Col(ColRef::new(tb, b))),
        (true, false) => Exp::op(Op::EqAny, ColRef::new(tb, b), Val::Col(ColRef::new(ta, a))),
        _ => Exp::op(Op::Eq, ColRef::new(ta, a), Val::Col(ColRef::new(tb, b))),
    }
}

pub fn is_integer_type(typ: &str) -> bool {
    matches!(
        typ,
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "tinyint" | "mediumint"
    )
}

pub fn is_numeric_type(typ: &str) -> bool {
    is_integer_type(typ)
        || matches!(
            typ,
            "numeric" | "decimal" | "real" | "double precision" | "float" | "double" | "float4" | "float8"
        )
}

fn is_bool_type(typ: &str) -> bool {
    matches!(typ, "boolean" | "bool" | "tinyint(1)")
}

fn is_json_type(typ: &str) -> bool {
    matches!(typ, "json" | "jsonb")
}

/// Convert a literal into a value compared against `col`. Strings must
/// be valid for numeric columns and floats never narrow to integers.
pub fn coerce(col: &DBColumn, node: &Node) -> Result<Val, CompileError> {
    let invalid = |msg: String| CompileError::InvalidValue {
        col: col.name.clone(),
        msg,
    };
    let typ = col.typ.as_str();

    let val = match node {
        Node::Var(v) => Val::Var(v.clone()),
        Node::Null => Val::Null,
        Node::Str(s) | Node::Label(s) => {
            if is_integer_type(typ) && !col.array {
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("'{}' is not a valid {}", s, typ)))?;
                Val::Num(s.trim().to_string())
            } else if is_numeric_type(typ) && !col.array {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("'{}' is not a valid {}", s, typ)))?;
                Val::Num(s.trim().to_string())
            } else if is_bool_type(typ) {
                match s.as_str() {
                    "true" => Val::Bool(true),
                    "false" => Val::Bool(false),
                    _ => return Err(invalid(format!("'{}' is not a boolean", s))),
                }
            } else {
                Val::Str(s.clone())
            }
        }
        Node::Int(n) => {
            if is_bool_type(typ) {
                return Err(invalid(format!("{} is not a boolean", n)));
            }
            if is_numeric_type(typ) {
                Val::Num(n.to_string())
            } else {
                Val::Str(n.to_string())
            }
        }
        Node::Float(f) => {
            if is_integer_type(typ) {
                return Err(invalid(format!("{} is not an integer", f)));
            }
            if is_bool_type(typ) {
                return Err(invalid(format!("{} is not a boolean", f)));
            }
            if is_numeric_type(typ) {
                Val::Num(f.to_string())
            } else {
                Val::Str(f.to_string())
            }
        }
        Node::Bool(b) => {
            if is_numeric_type(typ) && !is_bool_type(typ) {
                return Err(invalid(format!("{} is not a number", b)));
            }
            if is_bool_type(typ) {
                Val::Bool(*b)
            } else {
                Val::Str(b.to_string())
            }
        }
        Node::List(items) => {
            let mut elem = col.clone();
            elem.array = false;
            Val::List(items.iter().map(|n| coerce(&elem, n)).collect::<Result<_, _>>()?)
        }
        Node::Obj(_) => {
            if !is_json_type(typ) {
                return Err(invalid("objects can only be compared with json columns".into()));
            }
            Val::Str(node.to_json().to_string())
        }
    };
    Ok(val)
}

/// Table a filter is being compiled against.
#[derive(Debug, Clone)]
struct Scope {
    tid: usize,
    alias: String,
}

enum Slot {
    Leaf(Exp),
    And(Vec<usize>),
    Or(Vec<usize>),
    Not(Vec<usize>),
    Exists(Box<Join>, Vec<usize>),
}

enum Work<'a> {
    Obj(&'a Node, Scope, usize),
    Entry(&'a str, &'a Node, Scope, usize),
}

/// Result of compiling a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub exp: Exp,
    /// A user variable such as `$user_id` is referenced
    pub needs_user: bool,
}

/// Compiles filter objects against one schema. `aliases` numbers the
/// tables joined in by `EXISTS` filters so every alias is unique within
/// one compile.
pub struct FilterCompiler<'a> {
    pub schema: &'a DBSchema,
    pub camelcase: bool,
    pub aliases: &'a mut usize,
}

impl FilterCompiler<'_> {
    pub fn compile(&mut self, node: &Node, tid: usize, alias: &str) -> Result<Filter, CompileError> {
        if !matches!(node, Node::Obj(_)) {
            return Err(CompileError::InvalidFilter(format!(
                "expecting an object, found {}",
                node.kind()
            )));
        }

        let mut slots: Vec<Slot> = vec![Slot::And(Vec::new())];
        let mut needs_user = false;
        let mut st: Vec<Work> = vec![Work::Obj(
            node,
            Scope {
                tid,
                alias: alias.to_string(),
            },
            0,
        )];

        while let Some(w) = st.pop() {
            match w {
                Work::Obj(node, scope, parent) => {
                    let Node::Obj(items) = node else {
                        return Err(CompileError::InvalidFilter(format!(
                            "expecting an object, found {}",
                            node.kind()
                        )));
                    };
                    for (k, v) in items.iter().rev() {
                        st.push(Work::Entry(k, v, scope.clone(), parent));
                    }
                }

                Work::Entry(key, val, scope, parent) => match key {
                    "and" | "or" | "not" => {
                        let id = slots.len();
                        slots.push(match key {
                            "and" => Slot::And(Vec::new()),
                            "or" => Slot::Or(Vec::new()),
                            _ => Slot::Not(Vec::new()),
                        });
                        attach(&mut slots, parent, id);

                        match val {
                            Node::List(items) => {
                                for item in items.iter().rev() {
                                    st.push(Work::Obj(item, scope.clone(), id));
                                }
                            }
                            Node::Obj(_) => st.push(Work::Obj(val, scope, id)),
                            n => {
                                return Err(CompileError::InvalidFilter(format!(
                                    "'{}' expects an object or list, found {}",
                                    key,
                                    n.kind()
                                )));
                            }
                        }
                    }

                    _ => {
                        let name = if self.camelcase {
                            to_snake_case(key)
                        } else {
                            key.to_string()
                        };
                        let table = self.schema.table(scope.tid);

                        if let Some(col) = table.column(&name) {
                            let exp = self.column_exp(col, &scope.alias, val, &mut needs_user)?;
                            let id = slots.len();
                            slots.push(Slot::Leaf(exp));
                            attach(&mut slots, parent, id);
                            continue;
                        }

                        let (join, child) = self.join(&name, &scope)?;
                        let id = slots.len();
                        slots.push(Slot::Exists(Box::new(join), Vec::new()));
                        attach(&mut slots, parent, id);
                        st.push(Work::Obj(val, child, id));
                    }
                },
            }
        }

        let exp = assemble(slots)?;
        Ok(Filter { exp, needs_user })
    }

    fn column_exp(
        &self,
        col: &DBColumn,
        alias: &str,
        val: &Node,
        needs_user: &mut bool,
    ) -> Result<Exp, CompileError> {
        let Node::Obj(ops) = val else {
            return Err(CompileError::InvalidFilter(format!(
                "expecting an operator object for '{}', found {}",
                col.name,
                val.kind()
            )));
        };

        let mut exps = Vec::with_capacity(ops.len());
        for (name, v) in ops {
            let op = Op::parse(name).ok_or_else(|| CompileError::UnknownOp(name.clone()))?;
            if let Node::Var(var) = v {
                *needs_user |= USER_VARS.contains(&var.as_str());
            }

            let right = match op {
                Op::IsNull => match v {
                    Node::Bool(b) => Val::Bool(*b),
                    Node::Var(var) => Val::Var(var.clone()),
                    n => {
                        return Err(CompileError::InvalidValue {
                            col: col.name.clone(),
                            msg: format!("is_null expects a boolean, found {}", n.kind()),
                        });
                    }
                },
                Op::HasKey => match v {
                    Node::Str(s) | Node::Label(s) => Val::Str(s.clone()),
                    Node::Var(var) => Val::Var(var.clone()),
                    n => {
                        return Err(CompileError::InvalidValue {
                            col: col.name.clone(),
                            msg: format!("has_key expects a string, found {}", n.kind()),
                        });
                    }
                },
                op if op.takes_list() => match v {
                    Node::List(_) | Node::Var(_) => coerce(col, v)?,
                    n => {
                        return Err(CompileError::InvalidValue {
                            col: col.name.clone(),
                            msg: format!("{} expects a list, found {}", name, n.kind()),
                        });
                    }
                },
                _ => coerce(col, v)?,
            };
            exps.push(Exp::op(op, ColRef::new(alias, col), right));
        }

        Exp::all(exps).ok_or_else(|| {
            CompileError::InvalidFilter(format!("no operator given for '{}'", col.name))
        })
    }

    /// Correlated join for a filter on a related table.
    fn join(&mut self, name: &str, scope: &Scope) -> Result<(Join, Scope), CompileError> {
        let (cid, rel) = match self.schema.rel_by_name(scope.tid, name) {
            Some((cid, rel)) => (cid, rel),
            None => {
                let tr = self.schema.find(name).ok_or_else(|| {
                    CompileError::InvalidFilter(format!(
                        "'{}' is not a column or related table of '{}'",
                        name,
                        self.schema.table(scope.tid).name
                    ))
                })?;
                (tr.id, self.schema.get_rel(tr.id, scope.tid, None)?)
            }
        };

        if !matches!(
            rel.typ,
            RelType::OneToOne | RelType::OneToMany | RelType::OneToManyThrough | RelType::Recursive
        ) {
            return Err(CompileError::Unsupported(format!(
                "filtering on '{}' relationships",
                name
            )));
        }

        let t = self.schema.table(cid);
        let alias = format!("{}_{}", t.name, *self.aliases);
        *self.aliases += 1;

        let (on, through) = rel_join(rel, &alias, &scope.alias);
        Ok((
            Join {
                schema: t.schema.clone(),
                table: t.name.clone(),
                alias: alias.clone(),
                through,
                on,
            },
            Scope { tid: cid, alias },
        ))
    }
}

fn attach(slots: &mut [Slot], parent: usize, id: usize) {
    match &mut slots[parent] {
        Slot::And(c) | Slot::Or(c) | Slot::Not(c) | Slot::Exists(_, c) => c.push(id),
        Slot::Leaf(_) => {}
    }
}

/// Children always sit after their parent so a reverse pass sees every
/// child built before its parent.
fn assemble(slots: Vec<Slot>) -> Result<Exp, CompileError> {
    let mut built: Vec<Option<Exp>> = vec![None; slots.len()];
    let take = |built: &mut Vec<Option<Exp>>, ids: &[usize]| -> Vec<Exp> {
        ids.iter().filter_map(|&i| built[i].take()).collect()
    };

    for (i, slot) in slots.into_iter().enumerate().rev() {
        let exp = match slot {
            Slot::Leaf(e) => e,
            Slot::And(c) => match Exp::all(take(&mut built, &c)) {
                Some(e) => e,
                None => Exp::True,
            },
            Slot::Or(c) => {
                let mut list = take(&mut built, &c);
                match list.len() {
                    0 => Exp::False,
                    1 => list.remove(0),
                    _ => Exp::Or(list),
                }
            }
            Slot::Not(c) => {
                let inner = Exp::all(take(&mut built, &c)).unwrap_or(Exp::True);
                Exp::Not(Box::new(inner))
            }
            Slot::Exists(join, c) => Exp::Exists {
                join,
                exp: Box::new(Exp::all(take(&mut built, &c)).unwrap_or(Exp::True)),
            },
        };
        built[i] = Some(exp);
    }

    built
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| CompileError::InvalidFilter("empty filter".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_value;
    use crate::schema::testdata;
    use pretty_assertions::assert_eq;

    fn compile(filter: &str, table: &str) -> Result<Filter, CompileError> {
        let schema = DBSchema::new(&testdata::dbinfo(), &[]).unwrap();
        let tid = schema.find(table).unwrap().id;
        let node = parse_value(filter).unwrap();
        let mut n = 0;
        FilterCompiler {
            schema: &schema,
            camelcase: false,
            aliases: &mut n,
        }
        .compile(&node, tid, table)
    }

    fn col(table: &str, name: &str, typ: &str) -> ColRef {
        ColRef {
            table: table.into(),
            col: name.into(),
            typ: typ.into(),
            array: false,
        }
    }

    #[test]
    fn test_simple_filter() {
        let f = compile("{ id: { eq: 5 } }", "products").unwrap();
        assert_eq!(
            f.exp,
            Exp::op(Op::Eq, col("products", "id", "bigint"), Val::Num("5".into()))
        );
        assert!(!f.needs_user);
    }

    #[test]
    fn test_and_or_not() {
        let f = compile(
            r#"{ or: [{ price: { gt: 10 } }, { name: { ilike: "%x%" } }], not: { id: { is_null: true } } }"#,
            "products",
        )
        .unwrap();

        let Exp::And(items) = f.exp else {
            panic!("expected and");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            Exp::Or(vec![
                Exp::op(Op::Gt, col("products", "price", "numeric"), Val::Num("10".into())),
                Exp::op(Op::ILike, col("products", "name", "text"), Val::Str("%x%".into())),
            ])
        );
        assert_eq!(
            items[1],
            Exp::Not(Box::new(Exp::op(
                Op::IsNull,
                col("products", "id", "bigint"),
                Val::Bool(true)
            )))
        );
    }

    #[test]
    fn test_related_table_filter() {
        let f = compile("{ owner: { id: { eq: $user_id } } }", "products").unwrap();
        assert!(f.needs_user);

        let Exp::Exists { join, exp } = f.exp else {
            panic!("expected exists");
        };
        assert_eq!(join.table, "users");
        assert_eq!(join.alias, "users_0");
        assert_eq!(
            join.on,
            Exp::op(
                Op::Eq,
                col("users_0", "id", "bigint"),
                Val::Col(col("products", "owner_id", "bigint"))
            )
        );
        assert_eq!(
            *exp,
            Exp::op(Op::Eq, col("users_0", "id", "bigint"), Val::Var("user_id".into()))
        );
    }

    #[test]
    fn test_through_filter() {
        let f = compile(r#"{ customers: { email: { eq: "a@b.com" } } }"#, "products").unwrap();
        let Exp::Exists { join, .. } = f.exp else {
            panic!("expected exists");
        };
        let th = join.through.unwrap();
        assert_eq!(th.table, "purchases");
    }

    #[test]
    fn test_coercion_follows_column_type() {
        assert!(compile(r#"{ id: { eq: "12" } }"#, "products").is_ok());
        assert!(matches!(
            compile(r#"{ id: { eq: "abc" } }"#, "products"),
            Err(CompileError::InvalidValue { .. })
        ));
        assert!(matches!(
            compile("{ id: { eq: 1.5 } }", "products"),
            Err(CompileError::InvalidValue { .. })
        ));
        assert_eq!(
            compile("{ name: { eq: 12 } }", "products").unwrap().exp,
            Exp::op(Op::Eq, col("products", "name", "text"), Val::Str("12".into()))
        );
    }

    #[test]
    fn test_list_ops() {
        let f = compile("{ id: { in: [1, 2, 3] } }", "products").unwrap();
        assert_eq!(
            f.exp,
            Exp::op(
                Op::In,
                col("products", "id", "bigint"),
                Val::List(vec![
                    Val::Num("1".into()),
                    Val::Num("2".into()),
                    Val::Num("3".into())
                ])
            )
        );
        assert!(compile("{ id: { in: 1 } }", "products").is_err());
    }

    #[test]
    fn test_bad_filters() {
        assert!(matches!(
            compile("{ id: { near: 1 } }", "products"),
            Err(CompileError::UnknownOp(_))
        ));
        assert!(matches!(
            compile("{ nope: { eq: 1 } }", "products"),
            Err(CompileError::InvalidFilter(_))
        ));
        assert!(compile("{ id: 1 }", "products").is_err());
    }
}
