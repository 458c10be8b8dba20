use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::CONTENT_LENGTH;

use crate::error::{ExecError, Result};
use crate::event::AsyncEvent;
use crate::protocol::{PullKeys, PushUrls};
use crate::retry::{retry, RetryPolicy};
use crate::store::ObjectStore;

/// The three objects a job publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Log,
    Exit,
    Size,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Log => write!(f, "log"),
            Slot::Exit => write!(f, "exit"),
            Slot::Size => write!(f, "size"),
        }
    }
}

impl PushUrls {
    pub fn slot(&self, slot: Slot) -> &str {
        match slot {
            Slot::Log => &self.log,
            Slot::Exit => &self.exit,
            Slot::Size => &self.size,
        }
    }
}

impl PullKeys {
    pub fn slot(&self, slot: Slot) -> &str {
        match slot {
            Slot::Log => &self.log,
            Slot::Exit => &self.exit,
            Slot::Size => &self.size,
        }
    }
}

/// Where a job's log, exit, and size end up.
#[derive(Clone)]
pub enum Destination {
    /// HTTP PUT to caller-supplied urls.
    Push {
        client: reqwest::Client,
        urls: PushUrls,
    },
    /// Writes into the server's own store under per-job keys.
    Pull {
        store: Arc<dyn ObjectStore>,
        keys: PullKeys,
    },
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Push { urls, .. } => f.debug_struct("Push").field("urls", urls).finish(),
            Destination::Pull { keys, .. } => f.debug_struct("Pull").field("keys", keys).finish(),
        }
    }
}

impl Destination {
    pub fn for_event(
        event: &AsyncEvent,
        store: Arc<dyn ObjectStore>,
        client: reqwest::Client,
    ) -> Self {
        match &event.push_urls {
            Some(urls) => Destination::Push {
                client,
                urls: urls.clone(),
            },
            None => Destination::Pull {
                store,
                keys: event.pull_keys(),
            },
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Destination::Push { .. })
    }

    /// One write attempt.
    pub async fn write(&self, slot: Slot, body: Bytes) -> Result<()> {
        match self {
            Destination::Push { client, urls } => {
                let url = urls.slot(slot);
                let response = client
                    .put(url)
                    .header(CONTENT_LENGTH, body.len())
                    .body(body)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ExecError::PushRejected {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Ok(())
            }
            Destination::Pull { store, keys } => Ok(store.put(keys.slot(slot), body).await?),
        }
    }

    pub async fn write_with_retry(&self, slot: Slot, body: Bytes, policy: &RetryPolicy) -> Result<()> {
        retry(policy, || self.write(slot, body.clone())).await.inspect_err(|e| {
            tracing::error!(slot = %slot, error = %e, "Write to destination failed");
        })
    }
}
