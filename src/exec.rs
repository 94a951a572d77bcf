//! Database access.
//!
//! Every statement the compiler produces returns a single JSON value so
//! the driver surface is one call: run SQL with text arguments and read
//! back the JSON in the first column of the first row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, warn};

use crate::pool::{Pool, PoolOptions, Pooled};
use crate::sql::Dialect;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error("query failed: {0}")]
    Query(String),
    #[error("transaction already finished")]
    Finished,
    #[error("no free connection after {0:?}")]
    PoolTimeout(Duration),
    #[error("connection pool closed")]
    PoolClosed,
}

/// A database the compiled statements can run against.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run `sql` binding `args` as text parameters and return the JSON
    /// value of the first column of the first row.
    async fn query_json(&self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError>;

    async fn begin(&self) -> Result<Box<dyn Transaction>, ExecError>;

    /// Picks the catalog queries used for discovery and the SQL the
    /// statements are rendered in.
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSQL
    }
}

#[async_trait]
pub trait Transaction: Send {
    async fn query_json(&mut self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError>;

    async fn commit(self: Box<Self>) -> Result<(), ExecError>;

    async fn rollback(self: Box<Self>) -> Result<(), ExecError>;
}

/// PostgreSQL over a bounded pool of `tokio-postgres` connections. Each
/// statement or transaction holds one connection; closed connections are
/// dropped and replaced.
pub struct PgDatabase {
    pool: Arc<Pool<Client>>,
}

impl PgDatabase {
    /// Open the first connection up front so a bad URL fails here.
    pub async fn connect(url: &str, opts: PoolOptions) -> Result<Self, ExecError> {
        let url = url.to_string();
        let pool = Pool::new(opts, move || {
            let url = url.clone();
            async move { connect_with_retry(&url).await }
        });
        drop(pool.acquire().await?);
        debug!(max_conns = opts.max_conns, "database pool ready");
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<Pooled<Client>, ExecError> {
        // every idle connection may have closed, plus one fresh attempt
        for _ in 0..=self.pool.options().max_conns {
            let conn = self.pool.acquire().await?;
            if !conn.is_closed() {
                return Ok(conn);
            }
            warn!("database connection closed, reconnecting");
            conn.discard();
        }
        Err(ExecError::Connect("connections keep closing".into()))
    }

    pub fn pool(&self) -> &Pool<Client> {
        &self.pool
    }
}

async fn connect_with_retry(url: &str) -> Result<Client, ExecError> {
    let mut last = String::new();
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio_postgres::connect(url, NoTls).await {
            Ok((client, conn)) => {
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(error = %e, "database connection error");
                    }
                });
                return Ok(client);
            }
            Err(e) => {
                warn!(attempt, error = %e, "database connect failed");
                last = e.to_string();
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                }
            }
        }
    }
    Err(ExecError::Connect(last))
}

/// All parameters are declared `text` and cast inside the statement.
async fn pg_query(client: &Client, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
    debug!(sql, params = args.len(), "executing");
    let types = vec![Type::TEXT; args.len()];
    let stmt = client.prepare_typed(sql, &types).await?;
    let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = args
        .iter()
        .map(|a| a as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect();

    match client.query_opt(&stmt, &params).await? {
        Some(row) => Ok(row.try_get::<_, Option<Value>>(0)?),
        None => Ok(None),
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn query_json(&self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
        let client = self.client().await?;
        pg_query(&client, sql, args).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, ExecError> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
        }))
    }
}

/// Holds its pooled connection until commit or rollback.
pub struct PgTransaction {
    client: Option<Pooled<Client>>,
}

impl PgTransaction {
    async fn finish(&mut self, stmt: &str) -> Result<(), ExecError> {
        let client = self.client.take().ok_or(ExecError::Finished)?;
        let res = client.batch_execute(stmt).await;
        if let Err(e) = res {
            // state unknown, keep it out of the pool
            client.discard();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query_json(&mut self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
        let client = self.client.as_ref().ok_or(ExecError::Finished)?;
        pg_query(client, sql, args).await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), ExecError> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), ExecError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // dropped without commit, roll back before the connection is reused
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let res = client.batch_execute("ROLLBACK").await;
                    if let Err(e) = res {
                        error!(error = %e, "rollback failed");
                        client.discard();
                    }
                });
            }
            Err(_) => client.discard(),
        }
    }
}

/// Text form of a JSON variable for binding.
pub fn bind_value(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        v => Some(v.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    use super::*;

    /// Replays canned responses in call order and records every statement.
    /// A response of `{"__error": "..."}` fails the call.
    #[derive(Clone, Default)]
    pub struct FakeDb {
        inner: Arc<FakeInner>,
    }

    #[derive(Default)]
    struct FakeInner {
        responses: SyncMutex<VecDeque<Value>>,
        log: SyncMutex<Vec<(String, Vec<Option<String>>)>>,
        commits: SyncMutex<u32>,
        mysql: bool,
        /// Transactions check a connection out of this when set
        conns: Option<Arc<Pool<usize>>>,
    }

    impl FakeDb {
        pub fn new(responses: Vec<Value>) -> Self {
            Self::build(responses, false, None)
        }

        pub fn mysql(responses: Vec<Value>) -> Self {
            Self::build(responses, true, None)
        }

        /// Transactions share `max_conns` connections and give up waiting
        /// for one after 50ms.
        pub fn pooled(responses: Vec<Value>, max_conns: usize) -> Self {
            let opts = PoolOptions {
                max_conns,
                max_wait: Some(Duration::from_millis(50)),
            };
            let made = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let pool = Pool::new(opts, move || {
                let n = made.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok(n) }
            });
            Self::build(responses, false, Some(pool))
        }

        fn build(responses: Vec<Value>, mysql: bool, conns: Option<Arc<Pool<usize>>>) -> Self {
            Self {
                inner: Arc::new(FakeInner {
                    responses: SyncMutex::new(responses.into()),
                    mysql,
                    conns,
                    ..Default::default()
                }),
            }
        }

        pub fn push(&self, response: Value) {
            self.inner.responses.lock().push_back(response);
        }

        pub fn log(&self) -> Vec<(String, Vec<Option<String>>)> {
            self.inner.log.lock().clone()
        }

        pub fn commits(&self) -> u32 {
            *self.inner.commits.lock()
        }

        fn next(&self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
            self.inner.log.lock().push((sql.to_string(), args.to_vec()));
            let resp = self
                .inner
                .responses
                .lock()
                .pop_front()
                .ok_or_else(|| ExecError::Query("no response queued".into()))?;
            match resp {
                Value::Null => Ok(None),
                Value::Object(ref m) if m.contains_key("__error") => Err(ExecError::Query(
                    m["__error"].as_str().unwrap_or_default().to_string(),
                )),
                v => Ok(Some(v)),
            }
        }
    }

    #[async_trait]
    impl Database for FakeDb {
        async fn query_json(&self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
            self.next(sql, args)
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>, ExecError> {
            let conn = match &self.inner.conns {
                Some(pool) => Some(pool.acquire().await?),
                None => None,
            };
            Ok(Box::new(FakeTx {
                db: self.clone(),
                _conn: conn,
            }))
        }

        fn dialect(&self) -> Dialect {
            if self.inner.mysql {
                Dialect::MySQL
            } else {
                Dialect::PostgreSQL
            }
        }
    }

    struct FakeTx {
        db: FakeDb,
        _conn: Option<Pooled<usize>>,
    }

    #[async_trait]
    impl Transaction for FakeTx {
        async fn query_json(&mut self, sql: &str, args: &[Option<String>]) -> Result<Option<Value>, ExecError> {
            self.db.next(sql, args)
        }

        async fn commit(self: Box<Self>) -> Result<(), ExecError> {
            *self.db.inner.commits.lock() += 1;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_transactions_both_progress() {
        let db = FakeDb::pooled(vec![json!("a"), json!("b")], 2);
        let mut a = db.begin().await.unwrap();
        let mut b = db.begin().await.unwrap();
        assert_eq!(b.query_json("b", &[]).await.unwrap(), Some(json!("a")));
        b.commit().await.unwrap();
        assert_eq!(a.query_json("a", &[]).await.unwrap(), Some(json!("b")));
        a.commit().await.unwrap();
        assert_eq!(db.commits(), 2);
    }

    #[tokio::test]
    async fn test_transactions_beyond_pool_size_wait() {
        let db = FakeDb::pooled(vec![], 1);
        let held = db.begin().await.unwrap();
        assert!(matches!(db.begin().await.err(), Some(ExecError::PoolTimeout(_))));
        held.rollback().await.unwrap();
        assert!(db.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_db_replays_in_order() {
        let db = FakeDb::new(vec![json!(1), Value::Null, json!({"__error": "boom"})]);
        assert_eq!(db.query_json("a", &[]).await.unwrap(), Some(json!(1)));
        assert_eq!(db.query_json("b", &[Some("x".into())]).await.unwrap(), None);
        assert!(db.query_json("c", &[]).await.is_err());
        assert!(db.query_json("d", &[]).await.is_err());
        assert_eq!(db.log().len(), 4);
        assert_eq!(db.log()[1].1, vec![Some("x".to_string())]);
    }

    #[test]
    fn test_bind_value() {
        assert_eq!(bind_value(&json!(null)), None);
        assert_eq!(bind_value(&json!("a")), Some("a".into()));
        assert_eq!(bind_value(&json!(12)), Some("12".into()));
        assert_eq!(bind_value(&json!(true)), Some("true".into()));
        assert_eq!(bind_value(&json!([1, 2])), Some("[1,2]".into()));
        assert_eq!(bind_value(&json!({"a": 1})), Some(r#"{"a":1}"#.into()));
    }
}
