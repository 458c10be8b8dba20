//! Time-limited URLs for reading and writing store objects.
//!
//! A signed URL carries `expires` (unix seconds) and `signature`, a blake3
//! keyed hash over `"{METHOD}\n{key}\n{expires}"`. The `/blob/{*key}` routes
//! verify it before touching the store.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;

use crate::error::{ExecError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Put,
}

impl fmt::Display for SignedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignedMethod::Get => write!(f, "GET"),
            SignedMethod::Put => write!(f, "PUT"),
        }
    }
}

#[derive(Clone)]
pub struct UrlSigner {
    base_url: Url,
    key: [u8; 32],
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base_url: &str, key: [u8; 32]) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ExecError::InvalidRequest(format!("bad public url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ExecError::InvalidRequest(format!(
                "public url cannot be a base: {}",
                base_url
            )));
        }
        Ok(Self { base_url, key })
    }

    /// Parse a 64-char hex signing key.
    pub fn key_from_hex(hex_key: &str) -> Result<[u8; 32]> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| ExecError::InvalidRequest(format!("signing key is not hex: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| ExecError::InvalidRequest("signing key must be 32 bytes".to_string()))
    }

    pub fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        self.presign(SignedMethod::Get, key, ttl)
    }

    pub fn presign_put(&self, key: &str, ttl: Duration) -> Result<String> {
        self.presign(SignedMethod::Put, key, ttl)
    }

    fn presign(&self, method: SignedMethod, key: &str, ttl: Duration) -> Result<String> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(method, key, expires);

        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ExecError::Internal("public url cannot be a base".to_string()))?;
            segments.pop_if_empty().push("blob");
            segments.extend(key.split('/'));
        }
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.to_string())
    }

    fn sign(&self, method: SignedMethod, key: &str, expires: i64) -> String {
        let message = format!("{}\n{}\n{}", method, key, expires);
        blake3::keyed_hash(&self.key, message.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Check a signature for `method` on `key`. Expired or malformed
    /// signatures fail.
    pub fn verify(&self, method: SignedMethod, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(provided) = blake3::Hash::from_hex(signature) else {
            return false;
        };
        let message = format!("{}\n{}\n{}", method, key, expires);
        // blake3::Hash equality is constant-time.
        blake3::keyed_hash(&self.key, message.as_bytes()) == provided
    }
}
