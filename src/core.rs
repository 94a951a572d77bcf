//! The `GraphSql` service.
//!
//! Holds everything a request needs: the compiled schema state, the
//! compile cache, the allow-list and the database. The schema state is an
//! immutable snapshot behind an `Arc` that reloads replace as a whole, so
//! requests in flight finish against the snapshot they started with.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allow::{AllowList, Fs};
use crate::cache::{ApqCache, CacheKey, CompileCache, query_hash};
use crate::config::Config;
use crate::cursor::{CursorCodec, CursorError};
use crate::error::Error;
use crate::exec::{Database, ExecError, Transaction};
use crate::parser::parse;
use crate::qcode::roles::RoleRegistry;
use crate::qcode::validate::{ValidErr, validate};
use crate::qcode::{CacheControl, Compiler, CompilerConfig, QCode, QType, Skip};
use crate::remote::{self, Resolvers};
use crate::render::{Renderer, Statement};
use crate::schema::discover::discover;
use crate::schema::{Blocklist, DBInfo, DBSchema};
use crate::sql::Dialect;

/// One GraphQL request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Query text. May be left out for persisted and allow-listed queries.
    pub query: Option<String>,
    pub vars: Map<String, Value>,
    pub namespace: String,
    /// Operation name, used to find the query in the allow-list
    pub name: Option<String>,
    /// SHA-256 of the query for automatic persisted queries
    pub apq_hash: Option<String>,
    /// Role picked by the caller, skips role resolution
    pub role: Option<String>,
    /// Authenticated user, bound as `$user_id`
    pub user_id: Option<Value>,
}

impl Request {
    pub fn new(query: &str) -> Self {
        Self {
            query: Some(query.to_string()),
            ..Default::default()
        }
    }

    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn vars(mut self, vars: Value) -> Self {
        if let Value::Object(m) = vars {
            self.vars = m;
        }
        self
    }

    pub fn user(mut self, id: Value) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub data: Value,
    /// Role the query ran as
    pub role: String,
    pub name: String,
    pub operation: QType,
    /// Only set when debug is enabled
    pub sql: Option<String>,
    pub cache_control: Option<CacheControl>,
}

/// A query compiled for one role.
#[derive(Debug)]
pub struct Compiled {
    pub qc: QCode,
    pub stmt: Statement,
    /// Short hash of the statement, the scope cursor tokens are bound to
    pub fingerprint: String,
    /// Default variables stored with an allow-listed query
    pub defaults: Option<Map<String, Value>>,
}

/// Everything derived from one schema snapshot.
struct State {
    hash: u64,
    schema: Arc<DBSchema>,
    compiler: Compiler,
    renderer: Renderer,
    /// Picks the role of a user when custom roles are configured
    roles_stmt: Option<Statement>,
}

impl State {
    fn build(conf: &Config, info: &DBInfo) -> Result<Self, Error> {
        let schema = Arc::new(DBSchema::new(info, &conf.overlays())?);
        let roles = Arc::new(RoleRegistry::new(conf, &schema)?);
        let renderer = Renderer::new(Dialect::from_db_type(&info.typ), conf.vars.clone());
        let roles_stmt = match &conf.roles_query {
            Some(q) if conf.abac_enabled() => Some(renderer.roles_query(q, &roles)?),
            _ => None,
        };
        let compiler = Compiler::new(schema.clone(), roles, CompilerConfig::from(conf));
        Ok(Self {
            hash: info.hash(),
            schema,
            compiler,
            renderer,
            roles_stmt,
        })
    }

    fn compile(&self, query: &str, vars: &Map<String, Value>, role: &str) -> Result<Compiled, Error> {
        let qc = self.compiler.compile(query, vars, role)?;
        let stmt = self.renderer.render(&qc, &self.schema)?;
        let mut fingerprint = query_hash(&stmt.sql);
        fingerprint.truncate(16);
        Ok(Compiled {
            qc,
            stmt,
            fingerprint,
            defaults: None,
        })
    }
}

pub struct GraphSql {
    conf: Config,
    db: Arc<dyn Database>,
    state: RwLock<Arc<State>>,
    cache: CompileCache<Compiled>,
    apq: ApqCache,
    allow: Option<AllowList>,
    cursors: CursorCodec,
    resolvers: Resolvers,
    compiles: AtomicUsize,
}

impl GraphSql {
    pub fn new(conf: Config, info: DBInfo, db: Arc<dyn Database>) -> Result<Self, Error> {
        conf.validate()?;
        let state = State::build(&conf, &info)?;
        let cursors = match &conf.secret_key {
            Some(k) => CursorCodec::new(k),
            None => CursorCodec::random(),
        };
        info!(
            db_type = %info.typ,
            tables = info.tables.len(),
            production = conf.production,
            "schema loaded"
        );
        Ok(Self {
            apq: ApqCache::new(conf.apq_cache_size),
            conf,
            db,
            state: RwLock::new(Arc::new(state)),
            cache: CompileCache::new(),
            allow: None,
            cursors,
            resolvers: Resolvers::new(),
            compiles: AtomicUsize::new(0),
        })
    }

    /// Discover the schema through `db`. Its dialect picks the catalog
    /// queries and the SQL flavor statements are rendered in. `PgDatabase`
    /// is the bundled driver; MySQL runs through any `Database` whose
    /// `dialect` is `Dialect::MySQL`.
    pub async fn connect(conf: Config, db: Arc<dyn Database>) -> Result<Self, Error> {
        let blocklist = Blocklist::new(&conf.blocklist)?;
        let info = discover(db.as_ref(), db.dialect().db_type(), &blocklist).await?;
        Self::new(conf, info, db)
    }

    pub fn with_allow_list(mut self, fs: Arc<dyn Fs>) -> Self {
        self.allow = Some(AllowList::new(fs));
        self
    }

    pub fn with_resolvers(mut self, resolvers: Resolvers) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn schema(&self) -> Arc<DBSchema> {
        self.state.read().schema.clone()
    }

    /// Number of compiles run so far. Cached compiles are not counted.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Compile a request for `role` without running it.
    pub async fn compile(&self, req: &Request, role: &str) -> Result<Arc<Compiled>, Error> {
        let st = self.state.read().clone();
        let mut vars = req.vars.clone();
        self.prepare(&st, req, role, &mut vars).await
    }

    pub async fn execute(&self, req: Request) -> Result<Response, Error> {
        let st = self.state.read().clone();
        let mut vars = req.vars.clone();
        if let Some(id) = &req.user_id {
            vars.insert("user_id".to_string(), id.clone());
        }

        let mut tx = None;
        let res = self.run(&st, &req, &mut vars, &mut tx).await;
        let (c, role, data) = match (res, tx) {
            (Ok(r), Some(t)) => {
                t.commit().await?;
                r
            }
            (Err(e), Some(t)) => {
                if let Err(re) = t.rollback().await {
                    warn!(error = %re, "rollback failed");
                }
                return Err(e);
            }
            (r, None) => r?,
        };

        let mut data = data.unwrap_or(Value::Null);
        if c.qc.remotes().next().is_some() {
            remote::resolve(&c.qc, &mut data, &self.resolvers).await?;
        }
        self.seal_cursors(&c, &mut data)?;

        Ok(Response {
            data,
            role,
            name: c.qc.name.clone(),
            operation: c.qc.typ,
            sql: self.conf.debug.then(|| c.stmt.sql.clone()),
            cache_control: c.qc.cache_control.clone(),
        })
    }

    /// Resolve the role, compile and run the statement. With custom roles
    /// the roles query and the main statement share `tx`.
    async fn run(
        &self,
        st: &State,
        req: &Request,
        vars: &mut Map<String, Value>,
        tx: &mut Option<Box<dyn Transaction>>,
    ) -> Result<(Arc<Compiled>, String, Option<Value>), Error> {
        let mut role = match (&req.role, &req.user_id) {
            (Some(r), _) => r.clone(),
            (None, Some(_)) => "user".to_string(),
            (None, None) => "anon".to_string(),
        };

        if let Some(rs) = st.roles_stmt.as_ref().filter(|_| req.role.is_none() && req.user_id.is_some()) {
            let t = tx.insert(self.db.begin().await?);
            let v = t
                .query_json(&rs.sql, &rs.meta.args(vars))
                .await
                .map_err(|e| self.exec_err(e, &rs.sql))?;
            if let Some(Value::String(r)) = v {
                role = r;
            }
            debug!(role = %role, "resolved role");
        }

        let c = self.prepare(st, req, &role, vars).await?;
        validate(&c.qc.constraints, vars).map_err(Error::Validation)?;
        self.open_cursors(&c, vars)?;

        let args = c.stmt.meta.args(vars);
        debug!(name = %c.qc.name, role = %role, params = args.len(), "executing");
        let out = match tx.as_mut() {
            Some(t) => t.query_json(&c.stmt.sql, &args).await,
            None => self.db.query_json(&c.stmt.sql, &args).await,
        };
        let data = out.map_err(|e| self.exec_err(e, &c.stmt.sql))?;
        Ok((c, role, data))
    }

    /// Find the query text and compile it. In production only queries in
    /// the allow-list run and each is compiled once per role.
    async fn prepare(
        &self,
        st: &State,
        req: &Request,
        role: &str,
        vars: &mut Map<String, Value>,
    ) -> Result<Arc<Compiled>, Error> {
        let query = self.query_text(req)?;

        if self.conf.production {
            let name = match (&req.name, &query) {
                (Some(n), _) => n.clone(),
                (None, Some(q)) => parse(q)?.name,
                (None, None) => String::new(),
            };
            if name.is_empty() {
                return Err(Error::UnknownQuery("unnamed query".into()));
            }
            let allow = self
                .allow
                .as_ref()
                .ok_or_else(|| Error::UnknownQuery(name.clone()))?;

            let key = CacheKey::new(&req.namespace, &name, role);
            let c = self
                .cache
                .get_or_try_init(&key, || -> Result<Compiled, Error> {
                    let item = allow.get(&req.namespace, &name)?;
                    let defaults = match item.vars {
                        Some(Value::Object(m)) => Some(m),
                        _ => None,
                    };
                    let mut v = vars.clone();
                    merge_defaults(&mut v, defaults.as_ref());
                    let mut c = self.compile_now(st, &item.query, &v, role)?;
                    c.defaults = defaults;
                    Ok(c)
                })
                .await?;
            merge_defaults(vars, c.defaults.as_ref());
            return Ok(c);
        }

        let query = query.ok_or_else(|| Error::UnknownQuery("no query given".into()))?;
        let c = self.compile_now(st, &query, vars, role)?;
        if let Some(allow) = &self.allow {
            if !c.qc.name.is_empty() {
                let saved = Value::Object(req.vars.clone());
                allow.save(&req.namespace, &c.qc.name, &query, Some(&saved))?;
            }
        }
        Ok(Arc::new(c))
    }

    fn compile_now(&self, st: &State, query: &str, vars: &Map<String, Value>, role: &str) -> Result<Compiled, Error> {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        st.compile(query, vars, role)
    }

    fn query_text(&self, req: &Request) -> Result<Option<String>, Error> {
        match (&req.apq_hash, &req.query) {
            (Some(h), Some(q)) => {
                if !self.apq.put(h, q) {
                    return Err(Error::Validation(vec![ValidErr::new(
                        "persistedQuery",
                        "hash does not match query",
                    )]));
                }
                Ok(Some(q.clone()))
            }
            (Some(h), None) => self
                .apq
                .get(h)
                .map(|q| Some(q.to_string()))
                .ok_or_else(|| Error::UnknownQuery(format!("persisted query {}", h))),
            (None, q) => Ok(q.clone()),
        }
    }

    fn exec_err(&self, source: ExecError, sql: &str) -> Error {
        Error::Execution {
            source,
            sql: self.conf.debug.then(|| sql.to_string()),
        }
    }

    /// Replace incoming cursor tokens with the values they hold.
    fn open_cursors(&self, c: &Compiled, vars: &mut Map<String, Value>) -> Result<(), Error> {
        let qc = &c.qc;
        let mut done = HashSet::new();
        for s in &qc.selects {
            let Some(var) = &s.paging.cursor else {
                continue;
            };
            if !done.insert(var.as_str()) {
                continue;
            }
            let token = match vars.get(var) {
                Some(Value::String(t)) if !t.is_empty() => t.clone(),
                _ => {
                    vars.insert(var.clone(), Value::Null);
                    continue;
                }
            };
            let sealed = self.cursors.decrypt(&token)?;
            if sealed.scope != c.fingerprint {
                return Err(CursorError::WrongQuery.into());
            }
            let owned = qc
                .selects
                .iter()
                .any(|o| o.id == sealed.sel && o.paging.cursor.as_ref() == Some(var));
            if !owned {
                return Err(CursorError::WrongSelect.into());
            }
            vars.insert(var.clone(), Value::String(sealed.value));
        }
        Ok(())
    }

    /// Encrypt the `<field>_cursor` values of the result.
    fn seal_cursors(&self, c: &Compiled, data: &mut Value) -> Result<(), Error> {
        let qc = &c.qc;
        for s in &qc.selects {
            if s.skip != Skip::None || s.singular || !s.paging.is_cursor() {
                continue;
            }
            let path = qc.path(s.id);
            let Some((last, parent)) = path.split_last() else {
                continue;
            };
            let key = format!("{}_cursor", last);
            for obj in at_path(data, parent) {
                if let Some(Value::String(v)) = obj.get_mut(&key) {
                    *v = self.cursors.encrypt(&c.fingerprint, s.id, v)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild the state from a freshly discovered schema. Returns false
    /// when nothing changed.
    pub async fn reload(&self) -> Result<bool, Error> {
        let blocklist = Blocklist::new(&self.conf.blocklist)?;
        let info = discover(self.db.as_ref(), self.db.dialect().db_type(), &blocklist).await?;
        self.reload_with(&info)
    }

    /// Swap in state built from `info`. The current state stays live if
    /// the build fails.
    pub fn reload_with(&self, info: &DBInfo) -> Result<bool, Error> {
        if self.state.read().hash == info.hash() {
            debug!("schema unchanged");
            return Ok(false);
        }
        let st = State::build(&self.conf, info)?;
        *self.state.write() = Arc::new(st);
        self.cache.clear();
        info!(tables = info.tables.len(), "schema reloaded");
        Ok(true)
    }

    /// Reload the schema every `every` until the service is dropped.
    pub fn spawn_reloader(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gs) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = gs.reload().await {
                    error!(error = %e, "schema reload failed");
                }
            }
        })
    }
}

/// Fill in defaults the request did not set.
fn merge_defaults(vars: &mut Map<String, Value>, defaults: Option<&Map<String, Value>>) {
    for (k, v) in defaults.into_iter().flatten() {
        vars.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Every value at `path`, stepping through arrays.
fn at_path<'a>(data: &'a mut Value, path: &[String]) -> Vec<&'a mut Value> {
    let mut out = Vec::new();
    let mut stack = vec![(data, 0)];
    while let Some((v, depth)) = stack.pop() {
        match v {
            Value::Array(items) => stack.extend(items.iter_mut().map(|i| (i, depth))),
            v if depth == path.len() => out.push(v),
            Value::Object(m) => {
                if let Some(c) = m.get_mut(&path[depth]) {
                    stack.push((c, depth + 1));
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allow::MemFs;
    use crate::exec::tests::FakeDb;
    use crate::schema::testdata;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn service(conf: Value, db: &FakeDb) -> GraphSql {
        let conf: Config = serde_json::from_value(conf).unwrap();
        GraphSql::new(conf, testdata::dbinfo(), Arc::new(db.clone())).unwrap()
    }

    fn open() -> Value {
        json!({ "default_block": false, "secret_key": "s3cr3t", "debug": true })
    }

    #[tokio::test]
    async fn test_execute_returns_database_json() {
        let db = FakeDb::new(vec![json!({ "products": [{ "id": 1, "owner": { "id": 1, "full_name": "User 1" } }] })]);
        let gs = service(open(), &db);

        let res = gs
            .execute(Request::new("query getProducts { products(limit: 3) { id owner { id full_name } } }"))
            .await
            .unwrap();
        assert_eq!(res.role, "anon");
        assert_eq!(res.name, "getProducts");
        assert_eq!(res.data["products"][0]["owner"]["full_name"], json!("User 1"));

        let log = db.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.matches("LEFT OUTER JOIN LATERAL").count(), 1);
        assert!(log[0].0.contains("LIMIT 3"));
        assert_eq!(res.sql.as_deref(), Some(log[0].0.as_str()));
    }

    #[tokio::test]
    async fn test_user_id_is_bound() {
        let db = FakeDb::new(vec![json!({ "products": [] })]);
        let gs = service(open(), &db);
        gs.execute(Request::new("{ products(where: { owner_id: { eq: $user_id } }) { id } }").user(json!(7)))
            .await
            .unwrap();
        assert_eq!(db.log()[0].1, vec![Some("7".to_string())]);
    }

    #[tokio::test]
    async fn test_anonymous_user_var_is_rejected() {
        let db = FakeDb::new(vec![]);
        let gs = service(open(), &db);
        let err = gs
            .execute(Request::new("{ products(where: { owner: { id: { eq: $user_id } } }) { id } }"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(err.to_string(), "required variable user_id must be set");
        assert!(db.log().is_empty());
    }

    #[tokio::test]
    async fn test_roles_query_picks_blocked_role() {
        let db = FakeDb::new(vec![json!("disabled_user"), json!({ "users": null })]);
        let gs = service(
            json!({
                "roles_query": "SELECT * FROM users WHERE id = $user_id :: bigint",
                "roles": [{ "name": "disabled_user", "match": "disabled = true" }]
            }),
            &db,
        );

        let res = gs
            .execute(Request::new("{ users { id email } }").user(json!(5)))
            .await
            .unwrap();
        assert_eq!(res.role, "disabled_user");
        assert_eq!(res.data, json!({ "users": null }));

        let log = db.log();
        assert_eq!(log.len(), 2);
        assert!(log[0].0.contains("WHEN (disabled = true) THEN 'disabled_user'"));
        assert_eq!(log[0].1, vec![Some("5".to_string())]);
        assert!(log[1].0.contains("'users', NULL"));
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn test_open_transaction_does_not_block_others() {
        let abac = json!({
            "roles_query": "SELECT * FROM users WHERE id = $user_id :: bigint",
            "roles": [{ "name": "disabled_user", "match": "disabled = true" }]
        });

        let db = FakeDb::pooled(vec![json!("disabled_user"), json!({ "users": null })], 2);
        let gs = service(abac.clone(), &db);
        let slow = db.begin().await.unwrap();
        let res = gs
            .execute(Request::new("{ users { id } }").user(json!(5)))
            .await
            .unwrap();
        assert_eq!(res.role, "disabled_user");
        assert_eq!(db.commits(), 1);
        slow.commit().await.unwrap();

        let db = FakeDb::pooled(vec![], 1);
        let gs = service(abac, &db);
        let _slow = db.begin().await.unwrap();
        let err = gs
            .execute(Request::new("{ users { id } }").user(json!(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Execution {
                source: ExecError::PoolTimeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_uses_database_dialect() {
        let col = |name: &str, typ: &str, pk: bool| {
            json!({
                "schema": "shop", "table": "users", "kind": "table", "name": name, "type": typ,
                "not_null": pk, "primary_key": pk, "unique_key": pk,
                "array": false, "full_text": false,
                "fk_schema": "", "fk_table": "", "fk_col": ""
            })
        };
        let db = FakeDb::mysql(vec![
            json!({ "version": 80034, "schema": "shop", "name": "shop" }),
            json!([col("id", "bigint", true), col("email", "varchar", false)]),
            json!([]),
            json!({ "users": [{ "id": 1, "email": "a@b.c" }] }),
        ]);
        let conf: Config = serde_json::from_value(json!({ "default_block": false })).unwrap();
        let gs = GraphSql::connect(conf, Arc::new(db.clone())).await.unwrap();

        let res = gs
            .execute(Request::new("{ users(where: { id: { eq: $id } }) { id email } }").vars(json!({ "id": 1 })))
            .await
            .unwrap();
        assert_eq!(res.data["users"][0]["email"], json!("a@b.c"));

        let log = db.log();
        assert_eq!(log.len(), 4);
        assert!(log[0].0.contains("VERSION()"));
        assert!(log[1].0.contains("information_schema.columns"));
        assert!(log[3].0.contains("`users`"));
        assert!(log[3].0.contains('?'));
        assert_eq!(log[3].1, vec![Some("1".to_string())]);
    }

    #[tokio::test]
    async fn test_recursive_children_through_execute() {
        let replies: Vec<Value> = (96..=100).map(|id| json!({ "id": id })).collect();
        let db = FakeDb::new(vec![json!({ "comments": { "id": 95, "replies": replies } })]);
        let gs = service(open(), &db);

        let res = gs
            .execute(Request::new(
                r#"{ comments(id: 95) { id replies: comments(find: "children") { id } } }"#,
            ))
            .await
            .unwrap();
        let ids: Vec<i64> = res.data["comments"]["replies"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r["id"].as_i64())
            .collect();
        assert_eq!(res.data["comments"]["id"], json!(95));
        assert_eq!(ids, vec![96, 97, 98, 99, 100]);

        let sql = &db.log()[0].0;
        assert!(sql.contains("WITH RECURSIVE"));
        assert!(sql.contains("NOT (\"__rc_1\".\"id\" = ANY(\"__r\".\"__path\"))"));
        assert!(sql.contains("ORDER BY \"comments__1\".\"id\" ASC"));
    }

    #[tokio::test]
    async fn test_failed_query_rolls_back() {
        let db = FakeDb::new(vec![json!("user"), json!({ "__error": "boom" })]);
        let gs = service(
            json!({
                "default_block": false,
                "roles_query": "SELECT * FROM users WHERE id = $user_id :: bigint",
                "roles": [{ "name": "admin", "match": "id = 1" }]
            }),
            &db,
        );
        let err = gs
            .execute(Request::new("{ users { id } }").user(json!(5)))
            .await
            .unwrap_err();
        match err {
            Error::Execution { sql, .. } => assert_eq!(sql, None),
            e => panic!("unexpected {:?}", e),
        }
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors_are_collected() {
        let db = FakeDb::new(vec![]);
        let gs = service(open(), &db);
        let q = r#"query addUser @constraint(variable: "email", format: "email")
            @constraint(variable: "full_name", min: 3) { users { id } }"#;
        let err = gs
            .execute(Request::new(q).vars(json!({ "email": "nope", "full_name": "A" })))
            .await
            .unwrap_err();
        match err {
            Error::Validation(errs) => assert_eq!(errs.len(), 2),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_production_compiles_once() {
        let fs = Arc::new(MemFs::new());
        AllowList::new(fs.clone())
            .save("shop", "getProducts", "query getProducts { products { id } }", None)
            .unwrap();

        let db = FakeDb::new(vec![]);
        let mut conf = open();
        conf["production"] = json!(true);
        let gs = Arc::new(service(conf, &db).with_allow_list(fs));

        let req = Request::named("shop", "getProducts");
        let (a, b) = tokio::join!(
            {
                let (gs, req) = (gs.clone(), req.clone());
                tokio::spawn(async move { gs.compile(&req, "user").await.unwrap() })
            },
            {
                let (gs, req) = (gs.clone(), req.clone());
                tokio::spawn(async move { gs.compile(&req, "user").await.unwrap() })
            }
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gs.compile_count(), 1);

        let err = gs.compile(&Request::named("shop", "nope"), "user").await.unwrap_err();
        assert!(matches!(err, Error::UnknownQuery(_)));

        let err = gs
            .compile(&Request::new("query other { users { id } }"), "user")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownQuery(_)));
    }

    #[tokio::test]
    async fn test_dev_mode_saves_named_queries() {
        let fs = Arc::new(MemFs::new());
        let db = FakeDb::new(vec![json!({ "users": [] })]);
        let gs = service(open(), &db).with_allow_list(fs.clone());

        gs.execute(Request::new("query getUsers { users { id } }").vars(json!({ "limit": 2 })))
            .await
            .unwrap();
        let item = AllowList::new(fs).get("", "getUsers").unwrap();
        assert_eq!(item.query, "query getUsers { users { id } }");
        assert_eq!(item.vars, Some(json!({ "limit": 2 })));
    }

    #[tokio::test]
    async fn test_persisted_queries() {
        let db = FakeDb::new(vec![json!({ "users": [] }), json!({ "users": [] })]);
        let gs = service(open(), &db);
        let q = "{ users { id } }";
        let hash = crate::cache::query_hash(q);

        let missing = Request {
            apq_hash: Some(hash.clone()),
            ..Default::default()
        };
        assert!(matches!(gs.execute(missing.clone()).await, Err(Error::UnknownQuery(_))));

        let mut first = missing.clone();
        first.query = Some(q.to_string());
        gs.execute(first).await.unwrap();
        gs.execute(missing).await.unwrap();
        assert_eq!(db.log().len(), 2);
    }

    #[tokio::test]
    async fn test_cursors_are_sealed_and_opened() {
        let q = "{ products(first: 2, after: $cursor, order_by: { price: desc }) { id } }";
        let db = FakeDb::new(vec![
            json!({ "products": [{ "id": 1 }, { "id": 2 }], "products_cursor": "[9.5, 2]" }),
            json!({ "products": [], "products_cursor": null }),
        ]);
        let gs = service(open(), &db);

        let res = gs.execute(Request::new(q)).await.unwrap();
        let token = res.data["products_cursor"].as_str().unwrap().to_string();
        assert_ne!(token, "[9.5, 2]");
        assert_eq!(db.log()[0].1, vec![None]);

        let res = gs
            .execute(Request::new(q).vars(json!({ "cursor": token })))
            .await
            .unwrap();
        assert_eq!(res.data["products_cursor"], Value::Null);
        assert_eq!(db.log()[1].1, vec![Some("[9.5, 2]".to_string())]);

        let err = gs
            .execute(Request::new(q).vars(json!({ "cursor": "garbage" })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cursor(_)));
    }

    #[tokio::test]
    async fn test_cursor_from_another_query_is_rejected() {
        let by_price = "{ products(first: 2, after: $cursor, order_by: { price: desc }) { id } }";
        let by_name = "{ products(first: 2, after: $cursor, order_by: { name: asc }) { id } }";
        let db = FakeDb::new(vec![json!({ "products": [{ "id": 1 }], "products_cursor": "[9.5, 1]" })]);
        let gs = service(open(), &db);

        let res = gs.execute(Request::new(by_price)).await.unwrap();
        let token = res.data["products_cursor"].clone();

        let err = gs
            .execute(Request::new(by_name).vars(json!({ "cursor": token })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cursor(CursorError::WrongQuery)));
        assert_eq!(db.log().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_state_and_clears_cache() {
        let fs = Arc::new(MemFs::new());
        AllowList::new(fs.clone())
            .save("", "getUsers", "query getUsers { users { id } }", None)
            .unwrap();
        let db = FakeDb::new(vec![]);
        let mut conf = open();
        conf["production"] = json!(true);
        let gs = service(conf, &db).with_allow_list(fs);

        let req = Request::named("", "getUsers");
        gs.compile(&req, "user").await.unwrap();
        gs.compile(&req, "user").await.unwrap();
        assert_eq!(gs.compile_count(), 1);

        assert!(!gs.reload_with(&testdata::dbinfo()).unwrap());

        let mut info = testdata::dbinfo();
        info.tables.retain(|t| t.name != "notifications");
        let info = DBInfo::new(
            &info.typ,
            info.version,
            &info.schema,
            &info.name,
            info.tables,
            info.functions,
            &Blocklist::default(),
        );
        assert!(gs.reload_with(&info).unwrap());
        assert!(gs.schema().find("notifications").is_none());

        gs.compile(&req, "user").await.unwrap();
        assert_eq!(gs.compile_count(), 2);
    }

    #[test]
    fn test_at_path_steps_through_arrays() {
        let mut v = json!({ "a": [{ "b": 1 }, { "b": 2 }, { "c": 3 }] });
        let mut found: Vec<Value> = at_path(&mut v, &["a".to_string(), "b".to_string()])
            .into_iter()
            .map(|v| v.clone())
            .collect();
        found.sort_by_key(|v| v.as_i64());
        assert_eq!(found, vec![json!(1), json!(2)]);
        assert_eq!(at_path(&mut v, &[]).len(), 1);
    }
}
