//! Filter expressions, rendered with an explicit stack.

use crate::qcode::{ColRef, Exp, Op, Val};

use super::{Ctx, RenderError};

enum Step<'e> {
    Exp(&'e Exp),
    Text(String),
}

/// Table name to alias substitution for column references.
#[derive(Clone, Copy)]
pub(super) struct Remap<'s> {
    pub from: &'s str,
    pub to: &'s str,
}

impl<'s> Remap<'s> {
    pub fn none() -> Self {
        Remap { from: "", to: "" }
    }

    fn table<'t>(&self, t: &'t str) -> &'t str
    where
        's: 't,
    {
        if !self.from.is_empty() && t == self.from { self.to } else { t }
    }
}

impl Ctx<'_> {
    pub(super) fn exp(&mut self, e: &Exp, rm: Remap<'_>) -> Result<String, RenderError> {
        let mut out = String::new();
        let mut st = vec![Step::Exp(e)];

        while let Some(step) = st.pop() {
            let e = match step {
                Step::Text(t) => {
                    out.push_str(&t);
                    continue;
                }
                Step::Exp(e) => e,
            };

            match e {
                Exp::True => out.push_str("true"),
                Exp::False => out.push_str("false"),
                Exp::And(list) | Exp::Or(list) => {
                    if list.is_empty() {
                        out.push_str(if matches!(e, Exp::And(_)) { "true" } else { "false" });
                        continue;
                    }
                    let sep = if matches!(e, Exp::And(_)) { " AND " } else { " OR " };
                    st.push(Step::Text(")".into()));
                    for (i, x) in list.iter().enumerate().rev() {
                        st.push(Step::Exp(x));
                        if i > 0 {
                            st.push(Step::Text(sep.into()));
                        }
                    }
                    st.push(Step::Text("(".into()));
                }
                Exp::Not(x) => {
                    st.push(Step::Text(")".into()));
                    st.push(Step::Exp(x));
                    out.push_str("NOT (");
                }
                Exp::Op { op, left, right } => {
                    let s = self.op(*op, left, right, rm)?;
                    out.push('(');
                    out.push_str(&s);
                    out.push(')');
                }
                Exp::Exists { join, exp } => {
                    st.push(Step::Text("))".into()));
                    st.push(Step::Exp(exp));
                    st.push(Step::Text(") AND (".into()));
                    st.push(Step::Exp(&join.on));
                    st.push(Step::Text(" WHERE (".into()));
                    if let Some(th) = &join.through {
                        st.push(Step::Text(")".into()));
                        st.push(Step::Exp(&th.on));
                        st.push(Step::Text(format!(
                            " INNER JOIN {} ON (",
                            self.table(&th.schema, &th.table)
                        )));
                    }
                    out.push_str("EXISTS (SELECT 1 FROM ");
                    out.push_str(&self.table(&join.schema, &join.table));
                    out.push_str(" AS ");
                    out.push_str(&self.q(&join.alias));
                }
                Exp::Search { cols, val } => {
                    let s = self.search(cols, val, rm)?;
                    out.push('(');
                    out.push_str(&s);
                    out.push(')');
                }
                Exp::CursorEmpty(id) => {
                    out.push_str("NOT EXISTS (SELECT 1 FROM ");
                    out.push_str(&self.q(&format!("__cur_{}", id)));
                    out.push(')');
                }
            }
        }
        Ok(out)
    }

    fn colref(&self, c: &ColRef, rm: Remap<'_>) -> String {
        self.col(rm.table(&c.table), &c.col)
    }

    /// Full text match, `websearch_to_tsquery` or `MATCH ... AGAINST`.
    pub(super) fn search(&mut self, cols: &[ColRef], val: &Val, rm: Remap<'_>) -> Result<String, RenderError> {
        let q = match val {
            Val::Var(v) => self.param(v, "text", false),
            Val::Str(s) => self.lit(s),
            v => return Err(RenderError::Unsupported(format!("search on {:?}", v))),
        };
        if self.d.is_mysql() {
            let list: Vec<String> = cols.iter().map(|c| self.colref(c, rm)).collect();
            return Ok(format!(
                "MATCH ({}) AGAINST ({} IN NATURAL LANGUAGE MODE)",
                list.join(", "),
                q
            ));
        }
        let parts: Vec<String> = cols
            .iter()
            .map(|c| format!("{} @@ websearch_to_tsquery({})", self.tsvector(c, rm), q))
            .collect();
        Ok(parts.join(" OR "))
    }

    pub(super) fn tsvector(&self, c: &ColRef, rm: Remap<'_>) -> String {
        if c.typ == "tsvector" {
            self.colref(c, rm)
        } else {
            format!("to_tsvector({})", self.colref(c, rm))
        }
    }

    /// Right hand side of a comparison, typed after the left column.
    fn val(&mut self, v: &Val, left: &ColRef, rm: Remap<'_>) -> Result<String, RenderError> {
        let s = match v {
            Val::Str(s) => self.lit(s),
            Val::Num(n) => n.clone(),
            Val::Bool(b) => b.to_string(),
            Val::Null => "NULL".to_string(),
            Val::Var(name) => self.param(name, &left.typ, left.array),
            Val::Col(c) => self.colref(c, rm),
            Val::Sql(sql) => sql.clone(),
            Val::Cursor { sel, col } => format!(
                "(SELECT {} FROM {})",
                self.q(col),
                self.q(&format!("__cur_{}", sel))
            ),
            Val::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for i in items {
                    list.push(self.val(i, left, rm)?);
                }
                if self.d.is_mysql() {
                    format!("JSON_ARRAY({})", list.join(", "))
                } else if left.typ.is_empty() {
                    format!("ARRAY[{}]", list.join(", "))
                } else {
                    format!("ARRAY[{}] :: {}[]", list.join(", "), left.typ)
                }
            }
        };
        Ok(s)
    }

    /// Values compared element wise: `IN`, `ANY`, `?|`.
    fn list_val(&mut self, v: &Val, left: &ColRef, typ: &str, rm: Remap<'_>) -> Result<String, RenderError> {
        let col = ColRef {
            typ: typ.to_string(),
            array: true,
            ..left.clone()
        };
        match v {
            Val::List(_) | Val::Var(_) => self.val(v, &col, rm),
            v => {
                let one = self.val(v, left, rm)?;
                Ok(if self.d.is_mysql() {
                    format!("JSON_ARRAY({})", one)
                } else {
                    format!("ARRAY[{}]", one)
                })
            }
        }
    }

    fn op(&mut self, op: Op, left: &ColRef, right: &Val, rm: Remap<'_>) -> Result<String, RenderError> {
        let l = self.colref(left, rm);
        let my = self.d.is_mysql();

        if *right == Val::Null {
            match op {
                Op::Eq => return Ok(format!("{} IS NULL", l)),
                Op::Neq => return Ok(format!("{} IS NOT NULL", l)),
                _ => {}
            }
        }

        let simple = match op {
            Op::Eq => Some("="),
            Op::Neq => Some(if my { "!=" } else { "<>" }),
            Op::Gt => Some(">"),
            Op::Gte => Some(">="),
            Op::Lt => Some("<"),
            Op::Lte => Some("<="),
            Op::Like => Some("LIKE"),
            Op::NotLike => Some("NOT LIKE"),
            Op::ILike if !my => Some("ILIKE"),
            Op::NotILike if !my => Some("NOT ILIKE"),
            Op::Similar if !my => Some("SIMILAR TO"),
            Op::NotSimilar if !my => Some("NOT SIMILAR TO"),
            Op::Regex => Some(if my { "REGEXP" } else { "~" }),
            Op::NotRegex => Some(if my { "NOT REGEXP" } else { "!~" }),
            Op::IRegex if !my => Some("~*"),
            Op::NotIRegex if !my => Some("!~*"),
            _ => None,
        };
        if let Some(sym) = simple {
            let r = self.val(right, left, rm)?;
            return Ok(format!("{} {} {}", l, sym, r));
        }

        let s = match op {
            Op::ILike | Op::NotILike => {
                let r = self.val(right, left, rm)?;
                let not = if op == Op::NotILike { "NOT " } else { "" };
                format!("LOWER({}) {}LIKE LOWER({})", l, not, r)
            }
            Op::IRegex | Op::NotIRegex => {
                let r = self.val(right, left, rm)?;
                let not = if op == Op::NotIRegex { "NOT " } else { "" };
                format!("{}REGEXP_LIKE({}, {}, 'i')", not, l, r)
            }
            Op::Similar | Op::NotSimilar => {
                return Err(RenderError::Unsupported("similar to on mysql".into()));
            }
            Op::In | Op::NotIn => match right {
                Val::List(items) if items.is_empty() => {
                    (if op == Op::In { "false" } else { "true" }).to_string()
                }
                Val::List(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for i in items {
                        let scalar = ColRef {
                            array: false,
                            ..left.clone()
                        };
                        list.push(self.val(i, &scalar, rm)?);
                    }
                    let not = if op == Op::NotIn { "NOT " } else { "" };
                    format!("{} {}IN ({})", l, not, list.join(", "))
                }
                _ => {
                    let r = self.list_val(right, left, &left.typ, rm)?;
                    match (my, op) {
                        (true, Op::In) => format!("{} MEMBER OF ({})", l, r),
                        (true, _) => format!("NOT ({} MEMBER OF ({}))", l, r),
                        (false, Op::In) => format!("{} = ANY({})", l, r),
                        (false, _) => format!("{} <> ALL({})", l, r),
                    }
                }
            },
            Op::Contains | Op::ContainedIn => {
                let json = left.typ == "json" || left.typ == "jsonb";
                let r = if json {
                    match right {
                        Val::Var(v) => self.param(v, &left.typ, false),
                        v => self.val(v, left, rm)?,
                    }
                } else {
                    self.list_val(right, left, &left.typ, rm)?
                };
                match (my, op) {
                    (true, Op::Contains) => format!("JSON_CONTAINS({}, {})", l, r),
                    (true, _) => format!("JSON_CONTAINS({}, {})", r, l),
                    (false, Op::Contains) => format!("{} @> {}", l, r),
                    (false, _) => format!("{} <@ {}", l, r),
                }
            }
            Op::HasKey => {
                let text = ColRef {
                    typ: "text".into(),
                    array: false,
                    ..left.clone()
                };
                let r = self.val(right, &text, rm)?;
                if my {
                    format!("JSON_CONTAINS_PATH({}, 'one', CONCAT('$.', {}))", l, r)
                } else {
                    format!("{} ? {}", l, r)
                }
            }
            Op::HasKeyAny | Op::HasKeyAll => {
                if my {
                    return Err(RenderError::Unsupported("has_key_any and has_key_all on mysql".into()));
                }
                let r = self.list_val(right, left, "text", rm)?;
                let sym = if op == Op::HasKeyAny { "?|" } else { "?&" };
                format!("{} {} {}", l, sym, r)
            }
            Op::IsNull => match right {
                Val::Bool(true) => format!("{} IS NULL", l),
                Val::Bool(false) => format!("{} IS NOT NULL", l),
                v => {
                    let bool_col = ColRef {
                        typ: "boolean".into(),
                        array: false,
                        ..left.clone()
                    };
                    let r = self.val(v, &bool_col, rm)?;
                    format!("({}) = ({} IS NULL)", r, l)
                }
            },
            Op::EqAny => {
                let r = self.val(right, left, rm)?;
                if my {
                    format!("{} MEMBER OF ({})", l, r)
                } else {
                    format!("{} = ANY({})", l, r)
                }
            }
            _ => return Err(RenderError::Unsupported(format!("operator {:?}", op))),
        };
        Ok(s)
    }
}
