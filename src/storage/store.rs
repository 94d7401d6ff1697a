use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{ReaderState, StorageError};

/// A string key-value store in the shape of browser local storage.
///
/// One JSON document is kept per key. Implementations must be usable from
/// several tasks at once; writes replace the whole value.
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored value, or `None` if the key was never written.
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replaces the value stored under `key`.
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

fn check_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates if needed) the data directory.
    ///
    /// SEC-007: on Unix the directory is restricted to the current user.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to set data directory permissions to 0700"
                );
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        check_key(key)?;
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        check_key(key)?;
        atomic_write(&self.path_for(key), value.as_bytes()).map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })
    }
}

/// Writes `content` to `dst` through a temp file, fsync and rename, so the
/// destination is never left half-written.
fn atomic_write(dst: &Path, content: &[u8]) -> std::io::Result<()> {
    // SEC-009: unpredictable temp name plus create_new closes the symlink race.
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let temp_path = dst.with_extension(format!("tmp.{suffix}"));

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp_file.write_all(content)?;
        temp_file.sync_all()?;
        drop(temp_file);

        // Windows refuses to rename over an existing file
        #[cfg(windows)]
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }

        std::fs::rename(&temp_path, dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store, optionally bounded by a total byte quota the way
/// browser local storage is.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes once all values together would exceed
    /// `limit` bytes.
    pub fn with_quota(limit: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota: Some(limit),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        check_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        check_key(key)?;
        let mut entries = self.entries();

        if let Some(limit) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let size = others + key.len() + value.len();
            if size > limit {
                return Err(StorageError::QuotaExceeded { size, limit });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// ReaderState persistence
// ============================================================================

impl ReaderState {
    /// Loads the document stored under `key`; a missing key yields an empty
    /// state.
    pub fn load(store: &dyn KeyValueStore, key: &str) -> Result<Self, StorageError> {
        match store.load(key)? {
            None => Ok(Self::default()),
            Some(raw) if raw.trim().is_empty() => Ok(Self::default()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Serializes the whole state as the stored JSON document.
    pub fn to_document(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(StorageError::Serialize)
    }

    /// Writes the whole document under `key`.
    pub fn save(&self, store: &dyn KeyValueStore, key: &str) -> Result<(), StorageError> {
        store.save(key, &self.to_document()?)
    }
}
