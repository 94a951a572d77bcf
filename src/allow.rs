//! Allow-list of named queries.
//!
//! Each entry is a GraphQL document stored at `queries/<namespace>/<name>.gql`
//! with an optional `<name>.json` next to it holding default variables.
//! Storage goes through the [`Fs`] trait so the list can live on disk,
//! in memory or anywhere else that can read and write bytes by path.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

const QUERY_DIR: &str = "queries";

#[derive(Debug, Error)]
pub enum AllowError {
    #[error("query not found: {0}")]
    NotFound(String),
    #[error("invalid query name: '{0}'")]
    InvalidName(String),
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid default variables for {path}: {source}")]
    Vars {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// File-system-like storage. Paths use `/` separators and are relative to
/// the store root.
pub trait Fs: Send + Sync {
    fn get(&self, path: &str) -> io::Result<Vec<u8>>;
    fn put(&self, path: &str, data: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Files under a directory on the local disk.
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, path: &str) -> PathBuf {
        let mut p = self.root.clone();
        p.extend(path.split('/').filter(|s| !s.is_empty()));
        p
    }
}

impl Fs for OsFs {
    fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path(path))
    }

    fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let p = self.path(path);
        if let Some(dir) = p.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(p, data)
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        self.path(path).try_exists()
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fs for MemFs {
    fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.files.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.files.read().contains_key(path))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub namespace: String,
    pub name: String,
    pub query: String,
    /// Default variables, merged under the request's own
    pub vars: Option<Value>,
}

pub struct AllowList {
    fs: Arc<dyn Fs>,
}

impl AllowList {
    pub fn new(fs: Arc<dyn Fs>) -> Self {
        Self { fs }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Item, AllowError> {
        let base = base_path(namespace, name)?;
        let gql = format!("{}.gql", base);
        if !self.exists(&gql)? {
            return Err(AllowError::NotFound(display_name(namespace, name)));
        }

        let query = String::from_utf8_lossy(&self.read(&gql)?).into_owned();
        let json = format!("{}.json", base);
        let vars = if self.exists(&json)? {
            let data = self.read(&json)?;
            let v = serde_json::from_slice(&data).map_err(|source| AllowError::Vars {
                path: json.clone(),
                source,
            })?;
            Some(v)
        } else {
            None
        };

        debug!(namespace, name, "allow list hit");
        Ok(Item {
            namespace: namespace.to_string(),
            name: name.to_string(),
            query,
            vars,
        })
    }

    /// Store a query and its default variables. Writes nothing when the
    /// stored copy is already the same.
    pub fn save(&self, namespace: &str, name: &str, query: &str, vars: Option<&Value>) -> Result<(), AllowError> {
        let base = base_path(namespace, name)?;
        let gql = format!("{}.gql", base);
        let query = query.trim();

        let same = self.exists(&gql)? && String::from_utf8_lossy(&self.read(&gql)?).trim() == query;
        if !same {
            self.write(&gql, query.as_bytes())?;
            info!(namespace, name, "saved query to allow list");
        }

        let vars = vars.filter(|v| v.as_object().is_some_and(|m| !m.is_empty()));
        if let Some(v) = vars {
            let json = format!("{}.json", base);
            let data = serde_json::to_vec_pretty(v).map_err(|source| AllowError::Vars {
                path: json.clone(),
                source,
            })?;
            if !self.exists(&json)? || self.read(&json)? != data {
                self.write(&json, &data)?;
            }
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, AllowError> {
        self.fs.exists(path).map_err(|source| io_err(path, source))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, AllowError> {
        self.fs.get(path).map_err(|source| io_err(path, source))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), AllowError> {
        self.fs.put(path, data).map_err(|source| io_err(path, source))
    }
}

fn io_err(path: &str, source: io::Error) -> AllowError {
    AllowError::Io {
        path: path.to_string(),
        source,
    }
}

fn display_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn base_path(namespace: &str, name: &str) -> Result<String, AllowError> {
    if !valid_segment(name) {
        return Err(AllowError::InvalidName(name.to_string()));
    }
    if namespace.is_empty() {
        return Ok(format!("{}/{}", QUERY_DIR, name));
    }
    if !valid_segment(namespace) {
        return Err(AllowError::InvalidName(namespace.to_string()));
    }
    Ok(format!("{}/{}/{}", QUERY_DIR, namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_save_and_get() {
        let fs = Arc::new(MemFs::new());
        let al = AllowList::new(fs.clone());
        al.save("shop", "getProducts", "query getProducts { products { id } }\n", Some(&json!({"limit": 5})))
            .unwrap();

        assert!(fs.exists("queries/shop/getProducts.gql").unwrap());
        assert!(fs.exists("queries/shop/getProducts.json").unwrap());

        let item = al.get("shop", "getProducts").unwrap();
        assert_eq!(item.query, "query getProducts { products { id } }");
        assert_eq!(item.vars, Some(json!({"limit": 5})));
    }

    #[test]
    fn test_missing_query() {
        let al = AllowList::new(Arc::new(MemFs::new()));
        match al.get("", "getUsers") {
            Err(AllowError::NotFound(n)) => assert_eq!(n, "getUsers"),
            r => panic!("unexpected {:?}", r),
        }
        match al.get("admin", "getUsers") {
            Err(AllowError::NotFound(n)) => assert_eq!(n, "admin.getUsers"),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn test_empty_vars_are_not_written() {
        let fs = Arc::new(MemFs::new());
        let al = AllowList::new(fs.clone());
        al.save("", "q", "{ users { id } }", Some(&json!({}))).unwrap();
        assert!(fs.exists("queries/q.gql").unwrap());
        assert!(!fs.exists("queries/q.json").unwrap());
        assert_eq!(al.get("", "q").unwrap().vars, None);
    }

    #[test]
    fn test_names_cannot_escape_the_store() {
        let al = AllowList::new(Arc::new(MemFs::new()));
        for name in ["../etc/passwd", "a/b", "", ".hidden"] {
            assert!(matches!(
                al.save("", name, "{ users { id } }", None),
                Err(AllowError::InvalidName(_))
            ));
        }
        assert!(matches!(al.get("..", "q"), Err(AllowError::InvalidName(_))));
    }

    #[test]
    fn test_os_fs() {
        let dir = tempfile::tempdir().unwrap();
        let al = AllowList::new(Arc::new(OsFs::new(dir.path())));
        al.save("app", "getUser", "query getUser { user { id } }", None).unwrap();

        let on_disk = dir.path().join("queries").join("app").join("getUser.gql");
        assert_eq!(std::fs::read_to_string(on_disk).unwrap(), "query getUser { user { id } }");
        assert_eq!(al.get("app", "getUser").unwrap().query, "query getUser { user { id } }");
    }

    #[test]
    fn test_bad_default_vars() {
        let fs = Arc::new(MemFs::new());
        fs.put("queries/q.gql", b"{ users { id } }").unwrap();
        fs.put("queries/q.json", b"{ nope").unwrap();
        let al = AllowList::new(fs);
        assert!(matches!(al.get("", "q"), Err(AllowError::Vars { .. })));
    }
}
