//! Key-value persistence of configurations, results and restore points.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use derive_more::{Display, Error, From};

use crate::model::{BackupConfig, BackupResult, RestorePoint};

const CONFIG_PREFIX: &str = "backup_config_";
const RESULT_PREFIX: &str = "backup_result_";
const RESTORE_POINT_PREFIX: &str = "restore_point_";

const CONFIG_CATEGORY: &str = "backup_config";
const RESULT_CATEGORY: &str = "backup_result";
const RESTORE_POINT_CATEGORY: &str = "restore_point";

#[derive(Debug, Display, Error, From)]
pub enum StoreError {
    #[display("store I/O failed: {_0}")]
    Io(io::Error),
    #[display("stored value is malformed: {_0}")]
    Serde(serde_json::Error),
    #[display("store lock is poisoned")]
    #[from(ignore)]
    Poisoned,
}

/// Generic settings store shared with the rest of the application.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str, category: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Values of all keys starting with `prefix` in `category`, ordered by key.
    fn list_by_prefix(&self, prefix: &str, category: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    value: String,
    category: String,
}

type Entries = BTreeMap<String, Entry>;

fn list(entries: &Entries, prefix: &str, category: &str) -> Vec<String> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .filter(|(_, entry)| entry.category == category)
        .map(|(_, entry)| entry.value.clone())
        .collect()
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn put(&self, key: &str, value: &str, category: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                category: category.to_string(),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str, category: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(list(&entries, prefix, category))
    }
}

/// Store persisted as a single JSON document.
///
/// Every write replaces the document atomically (write to a temporary sibling, then rename).
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty if the file doesn't exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "store", "Starting with empty store at {}", path.display());
                Entries::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn put(&self, key: &str, value: &str, category: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                category: category.to_string(),
            },
        );

        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };

        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str, category: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(list(&entries, prefix, category))
    }
}

/// Typed access to the records of the backup engine.
#[derive(Clone)]
pub struct BackupRepository {
    store: std::sync::Arc<dyn KeyValueStore>,
}

impl BackupRepository {
    pub fn new(store: std::sync::Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.store
            .get(key)?
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(StoreError::from)
    }

    fn save<T: serde::Serialize>(&self, key: &str, value: &T, category: &str) -> Result<(), StoreError> {
        self.store.put(key, &serde_json::to_string(value)?, category)
    }

    fn load_all<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
        category: &str,
    ) -> Result<Vec<T>, StoreError> {
        self.store
            .list_by_prefix(prefix, category)?
            .iter()
            .map(|value| serde_json::from_str(value).map_err(StoreError::from))
            .collect()
    }

    pub fn config(&self, id: &str) -> Result<Option<BackupConfig>, StoreError> {
        self.load(&format!("{CONFIG_PREFIX}{id}"))
    }

    pub fn configs(&self) -> Result<Vec<BackupConfig>, StoreError> {
        self.load_all(CONFIG_PREFIX, CONFIG_CATEGORY)
    }

    pub fn save_config(&self, config: &BackupConfig) -> Result<(), StoreError> {
        self.save(&format!("{CONFIG_PREFIX}{}", config.id), config, CONFIG_CATEGORY)
    }

    pub fn delete_config(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(&format!("{CONFIG_PREFIX}{id}"))
    }

    pub fn result(&self, id: &str) -> Result<Option<BackupResult>, StoreError> {
        self.load(&format!("{RESULT_PREFIX}{id}"))
    }

    /// Results of one configuration, oldest first.
    pub fn results(&self, config_id: &str) -> Result<Vec<BackupResult>, StoreError> {
        let mut results: Vec<BackupResult> = self.load_all(RESULT_PREFIX, RESULT_CATEGORY)?;
        results.retain(|result| result.config_id == config_id);
        results.sort_by_key(|result| result.timestamp);
        Ok(results)
    }

    pub fn save_result(&self, result: &BackupResult) -> Result<(), StoreError> {
        self.save(&format!("{RESULT_PREFIX}{}", result.id), result, RESULT_CATEGORY)
    }

    pub fn delete_result(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(&format!("{RESULT_PREFIX}{id}"))
    }

    pub fn restore_point(&self, id: &str) -> Result<Option<RestorePoint>, StoreError> {
        self.load(&format!("{RESTORE_POINT_PREFIX}{id}"))
    }

    /// All restore points, oldest first.
    pub fn restore_points(&self) -> Result<Vec<RestorePoint>, StoreError> {
        let mut points: Vec<RestorePoint> =
            self.load_all(RESTORE_POINT_PREFIX, RESTORE_POINT_CATEGORY)?;
        points.sort_by_key(|point| point.timestamp);
        Ok(points)
    }

    pub fn save_restore_point(&self, point: &RestorePoint) -> Result<(), StoreError> {
        self.save(
            &format!("{RESTORE_POINT_PREFIX}{}", point.id),
            point,
            RESTORE_POINT_CATEGORY,
        )
    }
}
