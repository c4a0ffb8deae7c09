//! Durable key-value storage for the daily energy checkpoint.

use anyhow::{anyhow, Context};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{fs, io};

/// Synchronous get/set of opaque JSON records.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()>;
}

/// Keeps all records in a single JSON object on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> anyhow::Result<Map<String, Value>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", self.path.display()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut records = self.read_all().unwrap_or_default();
        records.insert(key.to_string(), value);
        let contents = serde_json::to_string_pretty(&records)?;

        // Write aside and rename so a crash never leaves a truncated file.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, contents)
            .with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// Volatile store. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(records.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("sma-power-flow-{name}-{nanos}.json"))
    }

    #[test]
    fn test_memory_store_clones_share_records() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.set("answer", json!(42)).unwrap();
        assert_eq!(observer.get("answer").unwrap(), Some(json!(42)));
        assert_eq!(observer.get("missing").unwrap(), None);
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let store = JsonFileStore::new(scratch_path("missing"));
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = scratch_path("reopen");
        let mut store = JsonFileStore::new(&path);
        store.set("first", json!({"day": 1})).unwrap();
        store.set("second", json!("two")).unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.get("first").unwrap(), Some(json!({"day": 1})));
        assert_eq!(reopened.get("second").unwrap(), Some(json!("two")));

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_file_store_corrupt_file_is_an_error() {
        let path = scratch_path("corrupt");
        fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(store.get("key").is_err());
        fs::remove_file(path).unwrap();
    }
}
