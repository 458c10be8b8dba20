//! Bearer credential resolution.
//!
//! The presented secret is hashed and looked up as `auth.{hash}` in a
//! key-value record store. Every failure, including an unreachable backend,
//! resolves to "unauthorized" so callers learn nothing about availability.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// One credential record: `id` is `auth.{hash_secret(secret)}`, `value` the
/// display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub id: String,
    pub value: String,
}

#[async_trait]
pub trait AuthRecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<AuthRecord>>;
}

#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Resolve a bearer secret to the principal name used to scope jobs.
    async fn resolve(&self, secret: &str) -> Option<String>;
}

pub fn hash_secret(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

pub fn record_id(secret: &str) -> String {
    format!("auth.{}", hash_secret(secret))
}

/// Resolver backed by an [`AuthRecordStore`].
pub struct StoreAuthResolver<S> {
    records: S,
}

impl<S: AuthRecordStore> StoreAuthResolver<S> {
    pub fn new(records: S) -> Self {
        Self { records }
    }
}

#[async_trait]
impl<S: AuthRecordStore> AuthResolver for StoreAuthResolver<S> {
    async fn resolve(&self, secret: &str) -> Option<String> {
        if secret.is_empty() {
            return None;
        }
        let hash = hash_secret(secret);
        let id = format!("auth.{}", hash);
        match self.records.get(&id).await {
            Ok(Some(record)) if !record.value.is_empty() => {
                // Name plus a short hash prefix keeps two keys sharing a
                // display name in separate namespaces.
                Some(format!("{}:{}", record.value, &hash[..16]))
            }
            Ok(_) => {
                tracing::debug!("Credential not found");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Credential backend error, denying");
                None
            }
        }
    }
}

/// Record store held in memory, optionally loaded from a JSON file of
/// `[{"id": "auth.<hash>", "value": "<name>"}]`.
#[derive(Debug, Default)]
pub struct MemoryAuthRecords {
    records: RwLock<HashMap<String, AuthRecord>>,
}

impl MemoryAuthRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = AuthRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let records: Vec<AuthRecord> = serde_json::from_slice(&data)?;
        tracing::info!(path = %path.display(), count = records.len(), "Loaded auth records");
        Ok(Self::from_records(records))
    }

    /// Register `secret` under `name`.
    pub async fn insert_secret(&self, secret: &str, name: &str) {
        let record = AuthRecord {
            id: record_id(secret),
            value: name.to_string(),
        };
        self.records.write().await.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl AuthRecordStore for MemoryAuthRecords {
    async fn get(&self, id: &str) -> Result<Option<AuthRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }
}
