//! Remote joins.
//!
//! A remote field comes back from the database holding only its key
//! column. After execution every such value is handed to the resolver
//! registered under the field's table name and replaced by what the
//! resolver returns. All fetches run concurrently and the first failure
//! fails the whole join.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::qcode::QCode;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("no resolver for remote field '{0}'")]
    NoResolver(String),
    #[error("remote field '{field}' failed: {msg}")]
    Failed { field: String, msg: String },
}

/// Fetches the value of a remote field from its key.
#[async_trait]
pub trait RemoteResolver: Send + Sync {
    async fn resolve(&self, id: &Value) -> Result<Value, RemoteError>;
}

/// Resolvers by remote table name.
#[derive(Clone, Default)]
pub struct Resolvers {
    map: HashMap<String, Arc<dyn RemoteResolver>>,
}

impl Resolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, r: Arc<dyn RemoteResolver>) {
        self.map.insert(name.to_string(), r);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A key waiting to be resolved, addressed by JSON pointer.
struct Slot {
    table: String,
    pointer: String,
    id: Value,
}

/// Replace the keys of every remote field in `data` with resolved values.
pub async fn resolve(qc: &QCode, data: &mut Value, resolvers: &Resolvers) -> Result<(), RemoteError> {
    let mut slots = Vec::new();
    for s in qc.remotes() {
        let path = qc.path(s.id);
        collect(data, &path, &s.table, &mut slots);
    }
    if slots.is_empty() {
        return Ok(());
    }
    debug!(fetches = slots.len(), "resolving remote fields");

    let fetches = slots.iter().map(|slot| async move {
        let r = resolvers
            .map
            .get(&slot.table)
            .ok_or_else(|| RemoteError::NoResolver(slot.table.clone()))?;
        r.resolve(&slot.id).await
    });
    let values = try_join_all(fetches).await?;

    for (slot, v) in slots.iter().zip(values) {
        if let Some(target) = data.pointer_mut(&slot.pointer) {
            *target = v;
        }
    }
    Ok(())
}

/// Find every non-null value at `path`, stepping through arrays.
fn collect(data: &Value, path: &[String], table: &str, out: &mut Vec<Slot>) {
    let mut stack = vec![(data, String::new(), 0)];
    while let Some((v, ptr, depth)) = stack.pop() {
        if depth == path.len() {
            if !v.is_null() {
                out.push(Slot {
                    table: table.to_string(),
                    pointer: ptr,
                    id: v.clone(),
                });
            }
            continue;
        }
        match v {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate().rev() {
                    stack.push((item, format!("{}/{}", ptr, i), depth));
                }
            }
            Value::Object(m) => {
                if let Some(child) = m.get(&path[depth]) {
                    stack.push((child, format!("{}/{}", ptr, escape(&path[depth])), depth + 1));
                }
            }
            _ => {}
        }
    }
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
