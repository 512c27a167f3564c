//! Key-addressed object storage for attachment bytes.
//!
//! The object store only ever sees what the facade hands it: ciphertext for
//! encrypted attachments, raw bytes for legacy ones.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};

/// Get/put/delete-by-key blob service.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Fetch the object under `key`.
    ///
    /// Returns `ObjectNotFound` if the key is absent.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Remove the object; `Ok(false)` if it was absent.
    async fn delete(&self, key: &str) -> StorageResult<bool>;
}

/// In-memory object store for testing.
///
/// Not persistent - all data is lost when the store is dropped.
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.lock().remove(key).is_some())
    }
}

/// Filesystem-backed object store rooted at a directory.
///
/// Keys map to relative paths under the root; `/` separates directories.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a reader never sees a half-written object
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::ObjectNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Reject keys that would escape the store root.
fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidObjectKey {
        key: key.to_string(),
    };
    if key.is_empty() || key.ends_with('/') || key.ends_with(".partial") {
        return Err(invalid());
    }
    let all_normal = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(invalid());
    }
    Ok(())
}
