//! Payloads handed from the dispatcher to the invocation layer.
//!
//! An [`Event`] crosses the queue as JSON bytes and is decoded on the worker
//! side, so submitter and executor share nothing but the encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{PullKeys, PushUrls};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event-type", rename_all = "kebab-case")]
pub enum Event {
    /// Run one job to completion.
    Exec(AsyncEvent),
    /// Delete expired job and activity objects.
    Sweep(SweepEvent),
}

impl Event {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Exec(_) => "exec",
            Event::Sweep(_) => "sweep",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncEvent {
    #[serde(rename = "auth-name")]
    pub auth_name: String,
    pub uid: String,
    #[serde(rename = "push-urls", default, skip_serializing_if = "Option::is_none")]
    pub push_urls: Option<PushUrls>,
    pub job: JobSpec,
}

impl AsyncEvent {
    pub fn pull_keys(&self) -> PullKeys {
        PullKeys::for_job(&self.auth_name, &self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum JobSpec {
    Subprocess {
        argv: Vec<String>,
    },
    Rpc {
        #[serde(rename = "rpc-name")]
        name: String,
        #[serde(rename = "rpc-args")]
        args: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepEvent {
    /// Objects last modified before this instant are deleted.
    pub cutoff: DateTime<Utc>,
}

/// Mint a job uid: unix seconds, then a random v4 uuid.
pub fn mint_uid() -> String {
    format!("{}.{}", Utc::now().timestamp(), Uuid::new_v4())
}

/// Uids become store key segments, so only minted shapes are accepted.
pub fn is_valid_uid(uid: &str) -> bool {
    let Some((secs, suffix)) = uid.split_once('.') else {
        return false;
    };
    !secs.is_empty()
        && secs.bytes().all(|b| b.is_ascii_digit())
        && !suffix.is_empty()
        && suffix
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b'-')
}
