//! Query compiler.
//!
//! Resolves a parsed operation against the relationship graph and the
//! role permission index, producing a [`QCode`]: a flat arena of
//! [`Select`] nodes linked by index. Selects are numbered as they are
//! discovered while walking the field tree with an explicit work stack,
//! so ids are stable for a given query, role and schema.

mod args;
mod directives;
mod exp;
mod fields;
pub mod mutate;
pub mod roles;
pub mod validate;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ast::{OpType, Operation, VarDef};
use crate::config::Config;
use crate::parser::{ParseError, parse};
use crate::schema::{DBColumn, DBRel, DBSchema, RelType, SchemaError, TableType, to_snake_case};

pub use directives::{CacheControl, CacheScope, FieldCond};
pub use exp::{ColRef, Exp, Filter, Join, Op, ThroughJoin, Val, coerce, col_eq, rel_join};
pub use mutate::{Mutate, MutateKind, Mutation};
use roles::{QueryPerms, Role, RoleRegistry};
use validate::{Constraint, ValidErr};

/// Variables that only exist for an authenticated user.
pub const USER_VARS: [&str; 3] = ["user_id", "user_id_raw", "user_id_provider"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PermissionError {
    #[error("column blocked: {table}.{column} (role: {role})")]
    ColumnBlocked {
        table: String,
        column: String,
        role: String,
    },

    #[error("{op} blocked: {table} (role: {role})")]
    OpBlocked {
        op: String,
        table: String,
        role: String,
    },

    #[error("required variable {0} must be set")]
    RequiredVar(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("validation failed")]
    Validation(Vec<ValidErr>),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("invalid argument '{arg}' on '{field}': {msg}")]
    InvalidArg {
        field: String,
        arg: String,
        msg: String,
    },

    #[error("invalid directive @{name} on '{field}': {msg}")]
    InvalidDirective {
        field: String,
        name: String,
        msg: String,
    },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid value for '{col}': {msg}")]
    InvalidValue { col: String, msg: String },

    #[error("unknown operator: {0}")]
    UnknownOp(String),

    #[error("table '{0}' has no primary key")]
    NoPrimaryKey(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("variable ${0} is not defined")]
    MissingVar(String),
}

impl CompileError {
    fn arg(field: &str, arg: &str, msg: impl Into<String>) -> Self {
        CompileError::InvalidArg {
            field: field.to_string(),
            arg: arg.to_string(),
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    Query,
    Subscription,
    Mutation,
}

/// Why a select renders `NULL` instead of a subquery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Skip {
    #[default]
    None,
    /// The role may not read this table
    Blocked,
    /// Depends on `$user_id` and the request is anonymous
    UserNeeded,
    /// Polymorphic member with no matching table
    TableNotFound,
    /// Filled in after execution by a remote resolver
    Remote,
    /// `@skip`/`@include` by role
    Nulled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelType {
    Normal,
    /// Polymorphic field, one member select per fragment type
    Union,
    /// Member of a union, carries the discriminator value
    Member(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Find {
    Children,
    Parents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl Order {
    pub fn parse(s: &str) -> Option<Order> {
        let o = match s {
            "asc" => Order::Asc,
            "desc" => Order::Desc,
            "asc_nulls_first" => Order::AscNullsFirst,
            "asc_nulls_last" => Order::AscNullsLast,
            "desc_nulls_first" => Order::DescNullsFirst,
            "desc_nulls_last" => Order::DescNullsLast,
            _ => return None,
        };
        Some(o)
    }

    pub fn is_desc(self) -> bool {
        matches!(self, Order::Desc | Order::DescNullsFirst | Order::DescNullsLast)
    }

    pub fn reverse(self) -> Order {
        match self {
            Order::Asc => Order::Desc,
            Order::Desc => Order::Asc,
            Order::AscNullsFirst => Order::DescNullsLast,
            Order::AscNullsLast => Order::DescNullsFirst,
            Order::DescNullsFirst => Order::AscNullsLast,
            Order::DescNullsLast => Order::AscNullsFirst,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub col: DBColumn,
    pub order: Order,
    /// Direction read from this variable at run time (`asc` or `desc`)
    pub var: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Count {
    Num(u32),
    Var(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PagingType {
    #[default]
    Offset,
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paging {
    pub typ: PagingType,
    pub limit: Option<Count>,
    pub offset: Option<Count>,
    /// Upper bound from the role config
    pub cap: Option<u32>,
    /// Variable holding the `after`/`before` cursor
    pub cursor: Option<String>,
    pub no_limit: bool,
}

impl Paging {
    pub fn is_cursor(&self) -> bool {
        self.typ != PagingType::Offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Col(DBColumn),
    /// `count_id`, `max_price`
    Agg { func: String, col: DBColumn },
    /// `upcase_name`
    Func { name: String, col: DBColumn, agg: bool },
    Typename(String),
    SearchRank,
    Child(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Key in the output object
    pub key: String,
    pub kind: FieldKind,
    /// Always `null` for this role
    pub null: bool,
    pub cond: Option<FieldCond>,
}

impl Field {
    /// Column alias of this field in the base select.
    pub fn alias(&self) -> Option<String> {
        match &self.kind {
            FieldKind::Col(c) => Some(c.name.clone()),
            FieldKind::Agg { func, col } => Some(format!("{}_{}", func, col.name)),
            FieldKind::Func { name, col, .. } => Some(format!("{}_{}", name, col.name)),
            FieldKind::SearchRank => Some("search_rank".to_string()),
            FieldKind::Typename(_) | FieldKind::Child(_) => None,
        }
    }

    pub fn is_agg(&self) -> bool {
        matches!(self.kind, FieldKind::Agg { .. } | FieldKind::Func { agg: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub id: usize,
    pub parent_id: Option<usize>,
    pub typ: SelType,
    pub tid: usize,
    pub schema: String,
    pub table: String,
    pub key: String,
    pub singular: bool,
    pub fields: Vec<Field>,
    pub filter: Option<Exp>,
    pub order_by: Vec<OrderBy>,
    pub distinct_on: Vec<DBColumn>,
    pub paging: Paging,
    /// Join to the parent select
    pub rel: Option<DBRel>,
    pub find: Option<Find>,
    pub search: Option<Val>,
    pub skip: Skip,
    pub cond: Option<FieldCond>,
    pub children: Vec<usize>,
}

impl Select {
    pub fn is_grouped(&self) -> bool {
        self.fields.iter().any(|f| !f.null && f.is_agg())
    }

    pub fn rel_type(&self) -> Option<RelType> {
        self.rel.as_ref().map(|r| r.typ)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QCode {
    pub typ: QType,
    pub name: String,
    pub role: Role,
    pub role_name: String,
    pub selects: Vec<Select>,
    pub roots: Vec<usize>,
    pub mutation: Option<Mutation>,
    pub var_defs: Vec<VarDef>,
    pub constraints: Vec<Constraint>,
    pub cache_control: Option<CacheControl>,
}

impl QCode {
    /// Keys leading from the response root to the given select. Union
    /// members share the key of their union.
    pub fn path(&self, id: usize) -> Vec<String> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(i) = cur {
            let s = &self.selects[i];
            if !matches!(s.typ, SelType::Member(_)) {
                path.push(s.key.clone());
            }
            cur = s.parent_id;
        }
        path.reverse();
        path
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Select> {
        self.selects.iter().filter(|s| s.skip == Skip::Remote)
    }
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub default_limit: u32,
    pub disable_functions: bool,
    pub enable_camelcase: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            disable_functions: false,
            enable_camelcase: false,
        }
    }
}

impl From<&Config> for CompilerConfig {
    fn from(c: &Config) -> Self {
        Self {
            default_limit: c.default_limit,
            disable_functions: c.disable_functions,
            enable_camelcase: c.enable_camelcase,
        }
    }
}

pub struct Compiler {
    schema: Arc<DBSchema>,
    roles: Arc<RoleRegistry>,
    conf: CompilerConfig,
}

impl Compiler {
    pub fn new(schema: Arc<DBSchema>, roles: Arc<RoleRegistry>, conf: CompilerConfig) -> Self {
        Self {
            schema,
            roles,
            conf,
        }
    }

    pub fn schema(&self) -> &DBSchema {
        &self.schema
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn compile(&self, query: &str, vars: &Map<String, Value>, role: &str) -> Result<QCode, CompileError> {
        let op = parse(query)?;
        self.compile_op(&op, vars, role)
    }

    pub fn compile_op(
        &self,
        op: &Operation,
        vars: &Map<String, Value>,
        role: &str,
    ) -> Result<QCode, CompileError> {
        let r = self
            .roles
            .resolve(role)
            .ok_or_else(|| CompileError::UnknownRole(role.to_string()))?;

        let typ = match op.typ {
            OpType::Query => QType::Query,
            OpType::Subscription => QType::Subscription,
            OpType::Mutation => QType::Mutation,
        };

        let mut cx = Ctx {
            schema: &self.schema,
            roles: &self.roles,
            conf: &self.conf,
            op,
            vars,
            role: r,
            role_name: role,
            qc: QCode {
                typ,
                name: op.name.clone(),
                role: r,
                role_name: role.to_string(),
                selects: Vec::new(),
                roots: Vec::new(),
                mutation: None,
                var_defs: op.var_defs.clone(),
                constraints: Vec::new(),
                cache_control: None,
            },
            pending: Vec::new(),
            stack: Vec::new(),
            aliases: 0,
        };

        cx.op_directives()?;
        if typ == QType::Mutation {
            cx.mutation_roots()?;
        } else {
            cx.query_roots()?;
        }
        cx.walk()?;

        debug!(
            name = %cx.qc.name,
            role,
            selects = cx.qc.selects.len(),
            "compiled"
        );
        Ok(cx.qc)
    }
}

/// Field ids still to be compiled for a select.
struct Pending {
    /// Field whose arguments and directives apply, `None` for union members
    args: Option<usize>,
    children: Vec<usize>,
}

/// State of one compile.
struct Ctx<'a> {
    schema: &'a DBSchema,
    roles: &'a RoleRegistry,
    conf: &'a CompilerConfig,
    op: &'a Operation,
    vars: &'a Map<String, Value>,
    role: Role,
    role_name: &'a str,
    qc: QCode,
    pending: Vec<Pending>,
    stack: Vec<usize>,
    aliases: usize,
}

impl Ctx<'_> {
    fn field_name(&self, name: &str) -> String {
        if self.conf.enable_camelcase {
            to_snake_case(name)
        } else {
            name.to_string()
        }
    }

    /// Append a select to the arena and queue it for compilation.
    fn add_select(&mut self, mut sel: Select, pending: Pending) -> usize {
        let id = self.qc.selects.len();
        sel.id = id;
        if let Some(pid) = sel.parent_id {
            self.qc.selects[pid].children.push(id);
        }
        self.qc.selects.push(sel);
        self.pending.push(pending);
        id
    }

    fn new_select(&self, tid: usize, key: &str, parent_id: Option<usize>) -> Select {
        let t = self.schema.table(tid);
        Select {
            id: 0,
            parent_id,
            typ: SelType::Normal,
            tid,
            schema: t.schema.clone(),
            table: t.name.clone(),
            key: key.to_string(),
            singular: false,
            fields: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            distinct_on: Vec::new(),
            paging: Paging::default(),
            rel: None,
            find: None,
            search: None,
            skip: Skip::None,
            cond: None,
            children: Vec::new(),
        }
    }

    fn query_roots(&mut self) -> Result<(), CompileError> {
        let op = self.op;
        for &fid in &op.roots {
            if let Some(id) = self.root_select(fid)? {
                self.qc.roots.push(id);
            }
        }
        Ok(())
    }

    /// Create the select for a top level field.
    fn root_select(&mut self, fid: usize) -> Result<Option<usize>, CompileError> {
        let op = self.op;
        let f = &op.fields[fid];
        let vis = directives::visibility(&f.directives, self.role_name, f.key())?;
        if vis == directives::Visibility::Drop {
            return Ok(None);
        }

        let mut name = self.field_name(&f.name);
        let mut by_id = false;
        for suffix in ["ByID", "ById", "_by_id"] {
            if let Some(n) = f.name.strip_suffix(suffix) {
                name = self.field_name(n);
                by_id = true;
                break;
            }
        }
        if by_id && f.arg("id").is_none() {
            return Err(CompileError::arg(f.key(), "id", "required"));
        }

        let tr = match directives::schema_name(&f.directives)? {
            Some(schema) => self.schema.find_in(&schema, &name),
            None => self.schema.find(&name),
        }
        .ok_or_else(|| SchemaError::TableNotFound(name.clone()))?;

        let mut sel = self.new_select(tr.id, f.key(), None);
        sel.singular = tr.singular || by_id || directives::has(&f.directives, "object");
        match vis {
            directives::Visibility::Null => sel.skip = Skip::Nulled,
            directives::Visibility::When(c) => sel.cond = Some(c),
            _ => {}
        }
        if self.schema.table(tr.id).typ == TableType::Virtual {
            return Err(CompileError::Unsupported(format!(
                "'{}' can only be selected under its parent",
                name
            )));
        }

        let id = self.add_select(
            sel,
            Pending {
                args: Some(fid),
                children: f.children.clone(),
            },
        );
        self.stack.push(id);
        Ok(Some(id))
    }

    /// Compile queued selects until the stack is empty.
    fn walk(&mut self) -> Result<(), CompileError> {
        // roots are pushed in order, pop them in order too
        self.stack.reverse();
        while let Some(id) = self.stack.pop() {
            let before = self.stack.len();
            self.compile_select(id)?;
            self.stack[before..].reverse();
        }
        Ok(())
    }

    fn compile_select(&mut self, id: usize) -> Result<(), CompileError> {
        if self.qc.selects[id].skip != Skip::None {
            return Ok(());
        }
        if self.qc.selects[id].typ == SelType::Union {
            return self.union_members(id);
        }

        let table = self.qc.selects[id].table.clone();
        let perms = match self.roles.table(self.role, &table) {
            Some(tp) => tp.query.clone().unwrap_or_default(),
            None if self.roles.default_blocked(self.role) => {
                warn!(table = %table, role = self.role_name, "table blocked for role");
                self.qc.selects[id].skip = Skip::Blocked;
                return Ok(());
            }
            None => QueryPerms::default(),
        };

        let args = self.pending[id].args;
        let mut filters = Vec::new();
        let mut user_filter = None;

        if let Some(fid) = args {
            user_filter = self.select_args(id, fid)?;
        }

        let mut role_needs_user = false;
        for node in &perms.filters {
            let tid = self.qc.selects[id].tid;
            let f = exp::FilterCompiler {
                schema: self.schema,
                camelcase: false,
                aliases: &mut self.aliases,
            }
            .compile(node, tid, &table)?;
            role_needs_user |= f.needs_user;
            filters.push(f.exp);
        }

        if self.role.is_anon() {
            let user_needed = user_filter.as_ref().is_some_and(|f| f.needs_user);
            if user_needed && self.qc.selects[id].parent_id.is_none() {
                return Err(PermissionError::RequiredVar(USER_VARS[0].to_string()).into());
            }
            if user_needed || role_needs_user {
                self.qc.selects[id].skip = Skip::UserNeeded;
                return Ok(());
            }
        }

        if perms.block {
            filters = vec![Exp::False];
        } else if let Some(f) = user_filter {
            filters.push(f.exp);
        }

        let children = self.pending[id].children.clone();
        self.select_fields(id, &children, &perms)?;

        let sel = &mut self.qc.selects[id];
        if let Some(search) = sel.search.clone() {
            let t = self.schema.table(sel.tid);
            let cols: Vec<ColRef> = t.full_text().map(|c| ColRef::new(&sel.table, c)).collect();
            if cols.is_empty() {
                return Err(CompileError::arg(&sel.key, "search", "table has no full text columns"));
            }
            filters.push(Exp::Search { cols, val: search });
        }

        let mut filter = Exp::all(filters);
        if sel.paging.is_cursor() {
            filter = Exp::and(filter, Some(self.seek(id)?));
        }
        self.qc.selects[id].filter = filter;

        self.limits(id, &perms);
        Ok(())
    }

    /// Default and role limits.
    fn limits(&mut self, id: usize, perms: &QueryPerms) {
        let default_limit = self.conf.default_limit;
        let sel = &mut self.qc.selects[id];
        if sel.singular || sel.paging.no_limit {
            sel.paging.limit = None;
            return;
        }
        if let Some(max) = perms.limit {
            match &sel.paging.limit {
                Some(Count::Num(n)) if *n > max => sel.paging.limit = Some(Count::Num(max)),
                Some(Count::Var(_)) => sel.paging.cap = Some(max),
                None => sel.paging.limit = Some(Count::Num(max.min(default_limit))),
                _ => {}
            }
        }
        if sel.paging.limit.is_none() {
            sel.paging.limit = Some(Count::Num(default_limit));
        }
    }

    /// Keyset condition for cursor paging: rows strictly after the last
    /// one seen, comparing the order columns left to right.
    fn seek(&mut self, id: usize) -> Result<Exp, CompileError> {
        let sel = &mut self.qc.selects[id];
        let t = self.schema.table(sel.tid);
        let pk = t
            .primary()
            .ok_or_else(|| CompileError::NoPrimaryKey(t.name.clone()))?;

        if !sel.order_by.iter().any(|o| o.col.name == pk.name) {
            sel.order_by.push(OrderBy {
                col: pk.clone(),
                order: Order::Asc,
                var: None,
            });
        }
        if sel.paging.typ == PagingType::Backward {
            for o in sel.order_by.iter_mut() {
                o.order = o.order.reverse();
            }
        }
        if sel.order_by.iter().any(|o| o.var.is_some()) {
            return Err(CompileError::Unsupported(
                "cursor paging with a variable sort order".into(),
            ));
        }

        let mut ors = Vec::with_capacity(sel.order_by.len());
        for (i, o) in sel.order_by.iter().enumerate() {
            let mut ands: Vec<Exp> = sel.order_by[..i]
                .iter()
                .map(|p| {
                    Exp::op(
                        Op::Eq,
                        ColRef::new(&sel.table, &p.col),
                        Val::Cursor {
                            sel: id,
                            col: p.col.name.clone(),
                        },
                    )
                })
                .collect();
            let op = if o.order.is_desc() { Op::Lt } else { Op::Gt };
            ands.push(Exp::op(
                op,
                ColRef::new(&sel.table, &o.col),
                Val::Cursor {
                    sel: id,
                    col: o.col.name.clone(),
                },
            ));
            ors.push(Exp::all(ands).unwrap_or(Exp::True));
        }

        let seek = if ors.len() == 1 {
            ors.remove(0)
        } else {
            Exp::Or(ors)
        };
        Ok(Exp::Or(vec![Exp::CursorEmpty(id), seek]))
    }

    /// One member select per fragment type of a polymorphic field.
    fn union_members(&mut self, id: usize) -> Result<(), CompileError> {
        let union = self.qc.selects[id].clone();
        let rel = union.rel.clone().ok_or_else(|| {
            CompileError::Unsupported(format!("'{}' has no polymorphic relationship", union.key))
        })?;

        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for &cid in &self.pending[id].children {
            let f = &self.op.fields[cid];
            let Some(tc) = &f.type_cond else { continue };
            match groups.iter_mut().find(|(t, _)| t == tc) {
                Some((_, ids)) => ids.push(cid),
                None => groups.push((tc.clone(), vec![cid])),
            }
        }

        let mut fields = Vec::with_capacity(groups.len());
        for (tname, children) in groups {
            let mut sel = match self.schema.find(&tname) {
                Some(tr) => {
                    let t = self.schema.table(tr.id);
                    let pk = t
                        .primary()
                        .ok_or_else(|| CompileError::NoPrimaryKey(t.name.clone()))?;
                    let mut sel = self.new_select(tr.id, &union.key, Some(id));
                    sel.rel = Some(DBRel {
                        left: crate::schema::RelEnd {
                            table: t.name.clone(),
                            col: pk.clone(),
                        },
                        ..rel.clone()
                    });
                    sel
                }
                None => {
                    let mut sel = self.new_select(union.tid, &union.key, Some(id));
                    sel.skip = Skip::TableNotFound;
                    sel
                }
            };
            sel.typ = SelType::Member(tname);
            sel.singular = true;

            let mid = self.add_select(
                sel,
                Pending {
                    args: None,
                    children,
                },
            );
            self.stack.push(mid);
            fields.push(Field {
                key: union.key.clone(),
                kind: FieldKind::Child(mid),
                null: false,
                cond: None,
            });
        }
        self.qc.selects[id].fields = fields;
        Ok(())
    }
}
