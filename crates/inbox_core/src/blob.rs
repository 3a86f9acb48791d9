use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StoreError, StoreResult};

/// Keys the notification store persists under.
pub mod keys {
    pub const DEVICE_TOKEN: &str = "inbox.device_token";
    pub const PUSH_TOKEN: &str = "inbox.push_token";
    pub const RECORDS: &str = "inbox.records";
    pub const TAGS: &str = "inbox.tags";
}

/// Opaque persistent string storage keyed by string.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// Reads and decodes a JSON value stored under `key`.
pub fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> StoreResult<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })
}

pub fn set_json<T: Serialize + ?Sized>(store: &dyn BlobStore, key: &str, value: &T) -> StoreResult<()> {
    let raw = serde_json::to_string(value).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &raw)
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// Keeps every key in a single JSON object on disk, rewritten on each mutation.
#[derive(Debug)]
pub struct FileBlobStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileBlobStore {
    /// Opens the store at `path`. A missing file is an empty store; an
    /// unreadable or malformed one is logged and treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match Self::read_values(&path) {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "discarding unreadable blob file");
                BTreeMap::new()
            }
        };
        tracing::debug!(path = %path.display(), keys = values.len(), "opened blob store");
        Self {
            path,
            values: RwLock::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_values(path: &Path) -> StoreResult<BTreeMap<String, String>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                key: path.display().to_string(),
                source,
            })?;
        let serde_json::Value::Object(map) = value else {
            return Err(StoreError::NotAnObject(path.to_path_buf()));
        };
        Ok(map
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect())
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> StoreResult<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let payload = serde_json::to_string_pretty(values).map_err(|source| StoreError::Json {
            key: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut values = self.values.write();
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());
        self.flush(&next)?;
        *values = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut values = self.values.write();
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.flush(&next)?;
        *values = next;
        Ok(())
    }
}
