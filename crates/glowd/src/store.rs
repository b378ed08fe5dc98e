//! Persistence store for automation state.
//!
//! A per-key string blob store used to remember timer expirations and
//! per-entity card settings across restarts. Key ownership is partitioned:
//! the timer engine owns `timer_expiration_<entity>`, the card layer owns
//! `card_settings_<entity>`. Store failures never propagate into the event
//! loop; callers log and degrade to in-memory behavior.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode store value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// JSON-file-backed store.
///
/// The whole key space is one flat JSON object, loaded at open and written
/// back through a temp-file rename on every mutation. Plenty for a handful
/// of cards.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open a store file, creating an empty store if the file is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(StoreError::Io {
                    path,
                    source: e,
                })
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        let io_err = |e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        };

        let encoded = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encoded).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl Store for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// In-memory store.
///
/// Used when no store path is configured and by tests. Countdowns do not
/// survive a restart with this store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("timer_expiration_light.a", "1700000000000").unwrap();
            store.set("card_settings_light.a", r#"{"name":"A"}"#).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            store.get("timer_expiration_light.a").unwrap(),
            Some("1700000000000".to_string())
        );

        store.remove("timer_expiration_light.a").unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);
        assert_eq!(
            store.get("card_settings_light.a").unwrap(),
            Some(r#"{"name":"A"}"#.to_string())
        );
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFileStore::open(&path).unwrap();

        store.remove("missing").unwrap();
        // No file should have been created for a no-op remove.
        assert!(!path.exists());
    }
}
