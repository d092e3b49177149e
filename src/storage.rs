//! Virtual storage - the host-owned key/value state sandboxed code sees as
//! `localStorage` / `sessionStorage`.
//!
//! The sandbox never touches the host's persistent storage. It relays
//! mutations as discrete [`StorageOperation`]s, the host applies them here and
//! persists the result through a [`DurableStore`], and the next synthesized
//! document is seeded from the updated state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Durable-store key holding the serialized [`VirtualStorageState`].
pub const STORAGE_STATE_KEY: &str = "preview.storage.v1";

/// Which of the two emulated stores an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    Local,
    Session,
}

impl StorageScope {
    /// Accepts both the short names and the global names the shim uses.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "local" | "localStorage" => Some(StorageScope::Local),
            "session" | "sessionStorage" => Some(StorageScope::Session),
            _ => None,
        }
    }

    /// Name of the global the shim installs for this scope.
    pub fn global_name(self) -> &'static str {
        match self {
            StorageScope::Local => "localStorage",
            StorageScope::Session => "sessionStorage",
        }
    }
}

/// A single relayed storage mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOperation {
    Set { key: String, value: String },
    Remove { key: String },
    Clear,
}

/// Host copy of both emulated stores.
///
/// Ordered maps keep the serialized seed byte-stable, which the synthesizer
/// relies on for reproducible documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualStorageState {
    #[serde(rename = "localStorage", default)]
    pub local: BTreeMap<String, String>,
    #[serde(rename = "sessionStorage", default)]
    pub session: BTreeMap<String, String>,
}

impl VirtualStorageState {
    pub fn scope(&self, scope: StorageScope) -> &BTreeMap<String, String> {
        match scope {
            StorageScope::Local => &self.local,
            StorageScope::Session => &self.session,
        }
    }

    pub fn scope_mut(&mut self, scope: StorageScope) -> &mut BTreeMap<String, String> {
        match scope {
            StorageScope::Local => &mut self.local,
            StorageScope::Session => &mut self.session,
        }
    }

    pub fn get(&self, scope: StorageScope, key: &str) -> Option<&str> {
        self.scope(scope).get(key).map(String::as_str)
    }

    /// Apply one operation. `remove` of an absent key is a no-op.
    pub fn apply(&mut self, scope: StorageScope, operation: StorageOperation) {
        let store = self.scope_mut(scope);
        match operation {
            StorageOperation::Set { key, value } => {
                store.insert(key, value);
            }
            StorageOperation::Remove { key } => {
                store.remove(&key);
            }
            StorageOperation::Clear => store.clear(),
        }
    }

    /// JSON text embedded into synthesized documents as the starting state.
    pub fn seed_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Lenient parse of persisted state.
    ///
    /// Anything that is not an object yields an empty scope; non-string values
    /// are coerced the way the in-context storage coerces them.
    pub fn from_persisted(raw: &str) -> Self {
        let Ok(Value::Object(root)) = serde_json::from_str::<Value>(raw) else {
            return Self::default();
        };
        let read_scope = |name: &str| -> BTreeMap<String, String> {
            match root.get(name) {
                Some(Value::Object(entries)) => entries
                    .iter()
                    .map(|(k, v)| (k.clone(), js_string(v)))
                    .collect(),
                _ => BTreeMap::new(),
            }
        };
        Self {
            local: read_scope(StorageScope::Local.global_name()),
            session: read_scope(StorageScope::Session.global_name()),
        }
    }

    /// Read the persisted state. A missing entry or a failed read is an empty state.
    pub fn load(store: &dyn DurableStore) -> Self {
        match store.read(STORAGE_STATE_KEY) {
            Ok(Some(raw)) => Self::from_persisted(&raw),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read virtual storage, starting empty");
                Self::default()
            }
        }
    }

    /// Best-effort write. Failures are logged and swallowed.
    pub fn persist(&self, store: &dyn DurableStore) {
        if let Err(e) = store.write(STORAGE_STATE_KEY, &self.seed_json()) {
            tracing::warn!(error = %e, "failed to persist virtual storage");
        }
    }
}

/// JavaScript `String(value)` for JSON values.
pub(crate) fn js_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|v| if v.is_null() { String::new() } else { js_string(v) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Host-side durable key/value store (the collaborator that outlives reloads).
pub trait DurableStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-process store, for tests and hosts without a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key under a directory: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create the store, creating `dir` if it does not exist.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    /// Keys map straight to file names, so only a safe character set is allowed.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl DurableStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        // Readers never observe a partial write.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn set(key: &str, value: &str) -> StorageOperation {
        StorageOperation::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_apply_operations() {
        let mut state = VirtualStorageState::default();
        state.apply(StorageScope::Local, set("a", "1"));
        state.apply(StorageScope::Local, set("a", "2"));
        state.apply(StorageScope::Session, set("b", "3"));
        assert_eq!(state.get(StorageScope::Local, "a"), Some("2"));
        assert_eq!(state.get(StorageScope::Session, "b"), Some("3"));

        state.apply(StorageScope::Local, StorageOperation::Remove { key: "missing".into() });
        assert_eq!(state.local.len(), 1);
        state.apply(StorageScope::Local, StorageOperation::Remove { key: "a".into() });
        assert!(state.local.is_empty());

        state.apply(StorageScope::Session, StorageOperation::Clear);
        assert!(state.session.is_empty());
    }

    #[test]
    fn test_seed_is_stable() {
        let mut a = VirtualStorageState::default();
        a.apply(StorageScope::Local, set("z", "1"));
        a.apply(StorageScope::Local, set("a", "2"));
        let mut b = VirtualStorageState::default();
        b.apply(StorageScope::Local, set("a", "2"));
        b.apply(StorageScope::Local, set("z", "1"));
        assert_eq!(a.seed_json(), b.seed_json());
        assert_eq!(
            a.seed_json(),
            r#"{"localStorage":{"a":"2","z":"1"},"sessionStorage":{}}"#
        );
    }

    #[test]
    fn test_from_persisted_is_lenient() {
        assert_eq!(VirtualStorageState::from_persisted("nope"), VirtualStorageState::default());
        assert_eq!(VirtualStorageState::from_persisted("[1]"), VirtualStorageState::default());

        let raw = json!({
            "localStorage": { "n": 5, "s": "x", "b": true },
            "sessionStorage": "broken"
        })
        .to_string();
        let state = VirtualStorageState::from_persisted(&raw);
        assert_eq!(state.get(StorageScope::Local, "n"), Some("5"));
        assert_eq!(state.get(StorageScope::Local, "s"), Some("x"));
        assert_eq!(state.get(StorageScope::Local, "b"), Some("true"));
        assert!(state.session.is_empty());
    }

    #[test]
    fn test_scope_names() {
        assert_eq!(StorageScope::parse("local"), Some(StorageScope::Local));
        assert_eq!(StorageScope::parse("sessionStorage"), Some(StorageScope::Session));
        assert_eq!(StorageScope::parse("cookies"), None);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state")).unwrap();
        assert!(store.read(STORAGE_STATE_KEY).unwrap().is_none());

        let mut state = VirtualStorageState::default();
        state.apply(StorageScope::Local, set("theme", "dark"));
        state.persist(&store);

        let loaded = VirtualStorageState::load(&store);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(matches!(store.write("../escape", "x"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.read("a/b"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.write("k", "v").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.read("other").unwrap(), None);
    }
}
