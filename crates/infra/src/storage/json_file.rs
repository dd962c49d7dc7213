//! JSON file storage
//!
//! All records live in one JSON object on disk, keyed like a browser's local
//! storage area. Writes go through a temporary file and a rename so a crash
//! never leaves a half-written record behind.

use async_trait::async_trait;
use eq8comp_core::domain::{StateStorage, StorageError};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

pub struct JsonFileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole record map
    ///
    /// A missing file is an empty map. A file that is not a JSON object is
    /// backed up next to the original and treated as empty.
    async fn read_all(&self) -> Result<Map<String, Value>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                let backup = self.path.with_extension("json.corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    "Storage file is not a JSON object, starting empty"
                );
                fs::copy(&self.path, &backup).await?;
                Ok(Map::new())
            }
        }
    }

    async fn write_all(&self, records: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStorage for JsonFileStorage {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        Ok(records.get(key).cloned())
    }

    #[instrument(skip(self, value), fields(path = %self.path.display()))]
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.insert(key.to_string(), value);
        self.write_all(&records).await?;
        debug!(records = records.len(), "Storage written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eq8comp_core::domain::store::load_state;
    use eq8comp_core::domain::{EffectState, StoreConfig, STORAGE_KEY};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_has_no_records() {
        let dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("state.json"));
        assert_eq!(storage.get(STORAGE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("nested").join("state.json"));

        storage.set("a", json!({ "x": 1 })).await.unwrap();
        storage.set("b", json!([1, 2])).await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), Some(json!({ "x": 1 })));
        assert_eq!(storage.get("b").await.unwrap(), Some(json!([1, 2])));
        assert!(!storage.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = EffectState::factory_default();
        JsonFileStorage::new(&path)
            .set(STORAGE_KEY, serde_json::to_value(&state).unwrap())
            .await
            .unwrap();

        let reopened = JsonFileStorage::new(&path);
        let value = reopened.get(STORAGE_KEY).await.unwrap().unwrap();
        let loaded: EffectState = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = JsonFileStorage::new(&path);
        assert_eq!(storage.get(STORAGE_KEY).await.unwrap(), None);
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_load_state_initialises_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let storage = JsonFileStorage::new(&path);

        let state = load_state(&storage, &StoreConfig::default()).await.unwrap();
        assert_eq!(state, EffectState::factory_default());

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk[STORAGE_KEY]["eqEnabled"], true);
    }
}
