//! Persistent key-value storage.
//!
//! Values are stored as JSON strings under namespaced keys. Two backends:
//! - [`FileStore`]: one JSON file per key in the platform config directory:
//!   - Linux: `~/.config/devchat/`
//!   - macOS: `~/Library/Application Support/devchat/`
//!   - Windows: `%APPDATA%\devchat\`
//! - [`MemoryStore`]: process-local, used for tests and unauthenticated runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

/// Key holding the bearer token.
pub const TOKEN_KEY: &str = "devchat.token";

/// Key holding the persisted channel cache.
pub const CHANNELS_CACHE_KEY: &str = "devchat.channels";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no config directory available")]
    NoConfigDir,
}

/// Raw string storage backend.
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_raw(&self, key: &str) -> Result<(), StorageError>;
}

/// Save a value as JSON.
pub fn save<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(value)?;
    store.set_raw(key, &json)
}

/// Load a JSON value. Returns `Ok(None)` if the key doesn't exist.
pub fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get_raw(key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Read the bearer token. A missing or unreadable token counts as absent.
pub fn read_token(store: &dyn KeyValueStore) -> Option<String> {
    match store.get_raw(TOKEN_KEY) {
        Ok(token) => token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read bearer token");
            None
        }
    }
}

// =========================================
// File backend
// =========================================

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store files under an explicit directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    /// Store files under the platform config directory.
    pub fn in_config_dir() -> Result<Self, StorageError> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Self::new(config_dir.join("devchat"))
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }
}

impl KeyValueStore for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.file_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::write(self.file_path(key), value)?;
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.file_path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// =========================================
// In-memory backend
// =========================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        let store = Self::default();
        store.lock().insert(TOKEN_KEY.to_string(), token.to_string());
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_sanitizes_keys() {
        let dir = std::env::temp_dir().join(format!("devchat-storage-{}", std::process::id()));
        let store = FileStore::new(&dir).unwrap();

        save(&store, "ns/key:1", &vec!["a", "b"]).unwrap();
        assert!(dir.join("ns_key_1.json").exists());

        let loaded: Option<Vec<String>> = load(&store, "ns/key:1").unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));

        store.remove_raw("ns/key:1").unwrap();
        store.remove_raw("ns/key:1").unwrap();
        assert_eq!(store.get_raw("ns/key:1").unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn blank_token_counts_as_absent() {
        let store = MemoryStore::with_token("  ");
        assert_eq!(read_token(&store), None);

        store.set_raw(TOKEN_KEY, "abc\n").unwrap();
        assert_eq!(read_token(&store).as_deref(), Some("abc"));
    }

    #[test]
    fn load_reports_corrupt_values() {
        let store = MemoryStore::new();
        store.set_raw("k", "{not json").unwrap();
        assert!(matches!(load::<Vec<String>>(&store, "k"), Err(StorageError::Serde(_))));
    }
}
