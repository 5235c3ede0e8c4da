//! Host key/value persistence.
//!
//! Provides the [`KeyValueStore`] contract plus two implementations: an
//! in-process map and a JSON file per scope on disk.

use super::ScopeId;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Scoped key/value state persisted by the host.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, scope: &ScopeId, key: &str) -> StoreResult<Option<Value>>;

    /// Write a value, replacing what was there.
    async fn set(&self, scope: &ScopeId, key: &str, value: Value) -> StoreResult<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, scope: &ScopeId, key: &str) -> StoreResult<()>;

    /// Shallow-merge an object into the stored value.
    async fn merge(&self, scope: &ScopeId, key: &str, patch: Value) -> StoreResult<()> {
        let current = self.get(scope, key).await?;
        let merged = match current {
            Some(existing) => merge_json(existing, patch),
            None => patch,
        };
        self.set(scope, key, merged).await
    }
}

/// Shared store handle.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Shallow merge: top-level keys of `patch` replace those in `base` when
/// both are objects; otherwise `patch` wins.
pub fn merge_json(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

/// In-memory store, lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<(ScopeId, String), Value>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all scopes.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, scope: &ScopeId, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .values
            .read()
            .await
            .get(&(scope.clone(), key.to_string()))
            .cloned())
    }

    async fn set(&self, scope: &ScopeId, key: &str, value: Value) -> StoreResult<()> {
        self.values
            .write()
            .await
            .insert((scope.clone(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, scope: &ScopeId, key: &str) -> StoreResult<()> {
        self.values
            .write()
            .await
            .remove(&(scope.clone(), key.to_string()));
        Ok(())
    }
}

/// Current file format version.
const FILE_VERSION: u32 = 1;

/// On-disk document holding every key of one scope.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScopeFile {
    version: u32,
    #[serde(default)]
    values: BTreeMap<String, Value>,
}

/// Stores each scope as a pretty-printed JSON file in a directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store files under `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the file backing `scope`.
    pub fn path_for(&self, scope: &ScopeId) -> PathBuf {
        let sanitized = scope
            .id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir
            .join(format!("{}_{sanitized}.json", scope.kind.name()))
    }

    async fn load(&self, scope: &ScopeId) -> StoreResult<ScopeFile> {
        let path = self.path_for(scope);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScopeFile {
                    version: FILE_VERSION,
                    values: BTreeMap::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let file: ScopeFile = serde_json::from_str(&content)?;
        if file.version != FILE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: FILE_VERSION,
                found: file.version,
            });
        }
        Ok(file)
    }

    async fn save(&self, scope: &ScopeId, file: &ScopeFile) -> StoreResult<()> {
        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(file)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, scope: &ScopeId, key: &str) -> StoreResult<Option<Value>> {
        let file = self.load(scope).await?;
        Ok(file.values.get(key).cloned())
    }

    async fn set(&self, scope: &ScopeId, key: &str, value: Value) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(scope).await?;
        file.values.insert(key.to_string(), value);
        self.save(scope, &file).await
    }

    async fn delete(&self, scope: &ScopeId, key: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(scope).await?;
        if file.values.remove(key).is_some() {
            self.save(scope, &file).await?;
        }
        Ok(())
    }

    async fn merge(&self, scope: &ScopeId, key: &str, patch: Value) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(scope).await?;
        let merged = match file.values.remove(key) {
            Some(existing) => merge_json(existing, patch),
            None => patch,
        };
        file.values.insert(key.to_string(), merged);
        self.save(scope, &file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_merge_json_objects() {
        let merged = merge_json(json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_merge_json_non_object_replaces() {
        assert_eq!(merge_json(json!([1, 2]), json!("x")), json!("x"));
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryStore::new();
        let scope = ScopeId::chat("c1");

        assert!(store.get(&scope, "memory").await.unwrap().is_none());
        store.set(&scope, "memory", json!({"x": 1})).await.unwrap();
        store.merge(&scope, "memory", json!({"y": 2})).await.unwrap();
        assert_eq!(
            store.get(&scope, "memory").await.unwrap(),
            Some(json!({"x": 1, "y": 2}))
        );

        store.delete(&scope, "memory").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_memory_scopes_are_isolated() {
        let store = InMemoryStore::new();
        store.set(&ScopeId::chat("a"), "k", json!(1)).await.unwrap();
        assert!(store.get(&ScopeId::chat("b"), "k").await.unwrap().is_none());
        assert!(store.get(&ScopeId::character("a"), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let scope = ScopeId::chat("chat/with spaces");

        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.set(&scope, "memory", json!({"cursor": 4})).await.unwrap();
            store.merge(&scope, "memory", json!({"summary": "hi"})).await.unwrap();
        }

        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get(&scope, "memory").await.unwrap(),
            Some(json!({"cursor": 4, "summary": "hi"}))
        );
        assert!(store.path_for(&scope).exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_other_versions() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let scope = ScopeId::chat("old");
        tokio::fs::write(store.path_for(&scope), r#"{"version": 99, "values": {}}"#)
            .await
            .unwrap();

        let err = store.get(&scope, "memory").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                expected: 1,
                found: 99
            }
        ));
    }

    #[tokio::test]
    async fn test_file_store_delete_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.delete(&ScopeId::chat("none"), "memory").await.unwrap();
    }
}
