//! Compiled query cache and the automatic persisted query store.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: String,
    pub name: String,
    pub role: String,
}

impl CacheKey {
    pub fn new(namespace: &str, name: &str, role: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        }
    }
}

/// One cell per key, each initialized at most once. The map lock is only
/// held to find or insert a cell, so compiles of different keys never
/// wait on each other.
pub struct CompileCache<T> {
    cells: Mutex<HashMap<CacheKey, Arc<OnceCell<Arc<T>>>>>,
}

impl<T> Default for CompileCache<T> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> CompileCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &CacheKey) -> Arc<OnceCell<Arc<T>>> {
        self.cells
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Cached value for `key`, running `init` if there is none yet.
    /// Concurrent callers for the same key wait for the first one. A
    /// failed `init` drops the empty cell so failing keys are not kept.
    pub async fn get_or_try_init<E, F>(&self, key: &CacheKey, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let cell = self.cell(key);
        match cell.get_or_try_init(|| async move { init().map(Arc::new) }).await {
            Ok(v) => Ok(v.clone()),
            Err(e) => {
                let mut cells = self.cells.lock();
                if cells
                    .get(key)
                    .is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized())
                {
                    cells.remove(key);
                }
                Err(e)
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.cells.lock().get(key).and_then(|c| c.get().cloned())
    }

    /// Drop everything. Compiles already in flight finish against the
    /// cells they hold and are not seen again.
    pub fn clear(&self) {
        self.cells.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cells.lock().values().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hex SHA-256 of a query, the key clients send for persisted queries.
pub fn query_hash(query: &str) -> String {
    format!("{:x}", Sha256::digest(query.as_bytes()))
}

/// Query text by hash for automatic persisted queries.
pub struct ApqCache {
    inner: Option<Mutex<LruCache<String, Arc<str>>>>,
}

impl ApqCache {
    /// A size of zero disables the cache.
    pub fn new(size: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(size).map(|n| Mutex::new(LruCache::new(n))),
        }
    }

    pub fn get(&self, hash: &str) -> Option<Arc<str>> {
        self.inner.as_ref()?.lock().get(hash).cloned()
    }

    /// Remember `query` under `hash`. Returns false when the hash does
    /// not match the query text.
    pub fn put(&self, hash: &str, query: &str) -> bool {
        if query_hash(query) != hash.to_ascii_lowercase() {
            return false;
        }
        if let Some(c) = &self.inner {
            c.lock().put(hash.to_ascii_lowercase(), Arc::from(query));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
