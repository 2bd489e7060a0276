//! Per-agent key/value storage.
//!
//! Writes land in an in-memory buffer and reach durable media only at
//! checkpoints (periodic flush and shutdown). A crash between checkpoints
//! loses the writes made since the last one.

pub mod backend;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::{StorageConfig, StorageKind};
use crate::error::{Error, Result};
use crate::identity::Address;

pub use backend::{JsonFileBackend, MemoryBackend, SqliteBackend, StorageBackend};

/// Buffered key/value namespace owned by one agent.
pub struct KeyValueStore {
    namespace: Address,
    entries: HashMap<String, Value>,
    backend: Box<dyn StorageBackend>,
    dirty: bool,
}

impl KeyValueStore {
    /// Open `namespace`, loading its last snapshot from `backend`.
    pub fn open(namespace: Address, backend: Box<dyn StorageBackend>) -> Result<Self> {
        let entries = backend.load(&namespace)?;
        tracing::debug!(
            "Opened storage for {} ({} entries, {})",
            namespace.short(),
            entries.len(),
            backend.describe()
        );
        Ok(Self {
            namespace,
            entries,
            backend,
            dirty: false,
        })
    }

    pub fn in_memory(namespace: Address) -> Self {
        Self {
            namespace,
            entries: HashMap::new(),
            backend: Box::new(MemoryBackend),
            dirty: false,
        }
    }

    pub fn namespace(&self) -> &Address {
        &self.namespace
    }

    /// `None` means the key was never set (or was removed).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the buffer to the backend if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.backend.save(&self.namespace, &self.entries)?;
        self.dirty = false;
        Ok(())
    }
}

/// Shared handle to an agent's store, handed to every context.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Mutex<KeyValueStore>>,
}

impl Storage {
    pub fn new(store: KeyValueStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Open the store for `namespace` as described by `config`.
    pub fn open(namespace: Address, config: &StorageConfig) -> Result<Self> {
        let backend: Box<dyn StorageBackend> = match config.kind {
            StorageKind::Memory => Box::new(MemoryBackend),
            StorageKind::Json => Box::new(JsonFileBackend::new(config.resolve_data_dir()?)),
            StorageKind::Sqlite => {
                let dir = config.resolve_data_dir()?;
                Box::new(SqliteBackend::new(Path::new(&dir).join("agents.db")))
            }
        };
        Ok(Self::new(KeyValueStore::open(namespace, backend)?))
    }

    pub fn in_memory(namespace: Address) -> Self {
        Self::new(KeyValueStore::in_memory(namespace))
    }

    fn lock(&self) -> MutexGuard<'_, KeyValueStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Typed read; a value that does not deserialize into `T` is an error.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Storage(format!("value for '{}' has unexpected shape: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().has(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.lock().set(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    fn address(seed: &str) -> Address {
        Identity::from_seed(seed).unwrap().address()
    }

    #[test]
    fn test_get_set_remove() {
        let storage = Storage::in_memory(address("kv"));

        assert_eq!(storage.get("missing"), None);
        storage.set("count", 1).unwrap();
        assert_eq!(storage.get("count"), Some(json!(1)));
        storage.set("count", 2).unwrap();
        assert_eq!(storage.get_as::<i64>("count").unwrap(), Some(2));

        storage.remove("count");
        assert!(!storage.has("count"));
        assert_eq!(storage.get_as::<i64>("count").unwrap(), None);

        // Removing an absent key is not an error.
        storage.remove("count");
    }

    #[test]
    fn test_typed_read_of_wrong_shape() {
        let storage = Storage::in_memory(address("shape"));
        storage.set("name", "alice").unwrap();
        assert!(matches!(storage.get_as::<i64>("name"), Err(Error::Storage(_))));
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ns = address("dirty");
        let mut store =
            KeyValueStore::open(ns, Box::new(JsonFileBackend::new(temp_dir.path()))).unwrap();
        assert!(!store.is_dirty());

        store.set("a", json!("b"));
        assert!(store.is_dirty());
        store.flush().unwrap();
        assert!(!store.is_dirty());

        store.remove("missing");
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_unflushed_writes_are_not_durable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ns = address("durable");
        let config = StorageConfig {
            kind: StorageKind::Json,
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let storage = Storage::open(ns, &config).unwrap();
        storage.set("flushed", true).unwrap();
        storage.flush().unwrap();
        storage.set("buffered", true).unwrap();
        drop(storage);

        let reopened = Storage::open(ns, &config).unwrap();
        assert_eq!(reopened.get("flushed"), Some(json!(true)));
        assert_eq!(reopened.get("buffered"), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            kind: StorageKind::Sqlite,
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let alice = Storage::open(address("alice"), &config).unwrap();
        let bob = Storage::open(address("bob"), &config).unwrap();
        alice.set("secret", "alice only").unwrap();
        alice.flush().unwrap();
        bob.flush().unwrap();

        let bob_again = Storage::open(address("bob"), &config).unwrap();
        assert_eq!(bob_again.get("secret"), None);
        let alice_again = Storage::open(address("alice"), &config).unwrap();
        assert_eq!(alice_again.get("secret"), Some(json!("alice only")));
    }
}
