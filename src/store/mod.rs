//! Durable object store used as the rendezvous between workers and readers.
//!
//! Pull-mode jobs publish `jobs/{auth}/{uid}/{log.txt,size,exit}` here; the
//! dispatcher and the tail reader read them back. Two implementations:
//!
//! - [`MemoryStore`]: process-local, used in tests
//! - [`FsStore`]: directory-backed bucket for a single-host deployment
//!
//! Range reads follow object-store semantics: a start offset at or past the
//! end of the object is [`StoreError::InvalidRange`], not an empty body.

pub mod fs;
pub mod signer;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

pub use fs::FsStore;
pub use signer::UrlSigner;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid range: start {start} of {key} ({len} bytes)")]
    InvalidRange { key: String, start: u64, len: u64 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Read an object from `start` to its end.
    async fn get_range(&self, key: &str, start: u64) -> Result<Bytes, StoreError>;

    /// Create or overwrite an object.
    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List objects whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;
}

/// Reject keys that could escape a bucket root or collide with temp files.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.contains('\\')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && !segment.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

pub(crate) fn slice_from(key: &str, data: &Bytes, start: u64) -> Result<Bytes, StoreError> {
    let len = data.len() as u64;
    if start >= len {
        return Err(StoreError::InvalidRange {
            key: key.to_string(),
            start,
            len,
        });
    }
    Ok(data.slice(start as usize..))
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, (Bytes, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an object's modification time (sweep tests).
    pub async fn set_modified(&self, key: &str, modified: DateTime<Utc>) {
        if let Some(entry) = self.objects.write().await.get_mut(key) {
            entry.1 = modified;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn get_range(&self, key: &str, start: u64) -> Result<Bytes, StoreError> {
        let data = self.get(key).await?;
        slice_from(key, &data, start)
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|(data, modified)| ObjectMeta {
                key: key.to_string(),
                size: data.len() as u64,
                modified: *modified,
            }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, modified))| ObjectMeta {
                key: key.clone(),
                size: data.len() as u64,
                modified: *modified,
            })
            .collect())
    }
}
