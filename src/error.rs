use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("RPC not found: {0}")]
    RpcNotFound(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Push to {url} rejected with status {status}")]
    PushRejected { url: String, status: u16 },

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Whether a single failed attempt is worth retrying.
    ///
    /// Definite rejections and local faults are not; network and store
    /// hiccups are.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecError::Http(_)
            | ExecError::PushRejected { .. }
            | ExecError::ServerError { .. }
            | ExecError::Io(_) => true,
            ExecError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definite_rejection_is_not_transient() {
        let err = ExecError::Rejected {
            status: 400,
            body: "bad".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!ExecError::Unauthorized.is_transient());
    }

    #[test]
    fn push_rejection_is_transient() {
        let err = ExecError::PushRejected {
            url: "http://x".to_string(),
            status: 503,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn store_not_found_is_not_transient() {
        assert!(!ExecError::Store(StoreError::NotFound("k".to_string())).is_transient());
    }
}
