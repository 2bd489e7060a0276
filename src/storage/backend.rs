//! Durable backends for agent storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::Address;

/// A durable home for one or more agent namespaces.
pub trait StorageBackend: Send {
    /// Load the last snapshot of `namespace`; an unknown namespace is empty.
    fn load(&self, namespace: &Address) -> Result<HashMap<String, Value>>;

    /// Replace the snapshot of `namespace` with `entries`.
    fn save(&self, namespace: &Address, entries: &HashMap<String, Value>) -> Result<()>;

    fn describe(&self) -> String;
}

/// No durability at all; everything lives in the agent's buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend;

impl StorageBackend for MemoryBackend {
    fn load(&self, _namespace: &Address) -> Result<HashMap<String, Value>> {
        Ok(HashMap::new())
    }

    fn save(&self, _namespace: &Address, _entries: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One pretty-printed JSON file per agent address.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Get the path for a namespace file.
    pub fn path_for(&self, namespace: &Address) -> PathBuf {
        self.dir.join(format!("{}_data.json", namespace))
    }
}

impl StorageBackend for JsonFileBackend {
    fn load(&self, namespace: &Address) -> Result<HashMap<String, Value>> {
        let path = self.path_for(namespace);
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let entries: HashMap<String, Value> = serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("corrupt snapshot {}: {}", path.display(), e)))?;
        Ok(entries)
    }

    fn save(&self, namespace: &Address, entries: &HashMap<String, Value>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(namespace);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!("Saved {} storage entries to {}", entries.len(), path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.dir.display())
    }
}

/// SQLite database holding every namespace in one `kv` table.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(conn)
    }
}

impl StorageBackend for SqliteBackend {
    fn load(&self, namespace: &Address) -> Result<HashMap<String, Value>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = HashMap::new();
        for row in rows {
            let (key, raw) = row?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| Error::Storage(format!("corrupt value for '{}': {}", key, e)))?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn save(&self, namespace: &Address, entries: &HashMap<String, Value>) -> Result<()> {
        let mut conn = self.connect()?;
        let ns = namespace.to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM kv WHERE namespace = ?1", params![ns])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (key, value) in entries {
                stmt.execute(params![ns, key, serde_json::to_string(value)?, now])?;
            }
        }
        tx.commit()?;

        tracing::debug!("Saved {} storage entries for {} to sqlite", entries.len(), namespace.short());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    fn sample() -> HashMap<String, Value> {
        let mut entries = HashMap::new();
        entries.insert("counter".to_string(), json!(3));
        entries.insert("profile".to_string(), json!({ "name": "alice", "tags": ["a", "b"] }));
        entries
    }

    #[test]
    fn test_json_backend_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(temp_dir.path());
        let address = Identity::from_seed("json").unwrap().address();

        assert!(backend.load(&address).unwrap().is_empty());
        backend.save(&address, &sample()).unwrap();
        assert!(backend.path_for(&address).exists());
        assert_eq!(backend.load(&address).unwrap(), sample());
    }

    #[test]
    fn test_sqlite_backend_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(temp_dir.path().join("agents.db"));
        let alice = Identity::from_seed("alice").unwrap().address();
        let bob = Identity::from_seed("bob").unwrap().address();

        backend.save(&alice, &sample()).unwrap();
        let mut other = HashMap::new();
        other.insert("counter".to_string(), json!(99));
        backend.save(&bob, &other).unwrap();

        assert_eq!(backend.load(&alice).unwrap(), sample());
        assert_eq!(backend.load(&bob).unwrap(), other);

        // A later snapshot replaces the earlier one entirely.
        let mut smaller = HashMap::new();
        smaller.insert("counter".to_string(), json!(4));
        backend.save(&alice, &smaller).unwrap();
        assert_eq!(backend.load(&alice).unwrap(), smaller);
    }

    #[test]
    fn test_corrupt_json_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(temp_dir.path());
        let address = Identity::from_seed("corrupt").unwrap().address();
        std::fs::write(backend.path_for(&address), "{ not json").unwrap();

        assert!(matches!(backend.load(&address), Err(Error::Storage(_))));
    }
}
