//! Per-process request activity, batched into the object store.
//!
//! Lines accumulate in memory and are flushed on an interval to
//! `logs/{unix}.{instance}.{seq:03}`. A failed flush keeps the batch for
//! the next attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::retry::{retry, RetryPolicy};
use crate::store::ObjectStore;

#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<ActivityInner>,
}

struct ActivityInner {
    store: Arc<dyn ObjectStore>,
    instance: String,
    lines: Mutex<Vec<String>>,
    seq: AtomicU64,
    retry: RetryPolicy,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: Arc::new(ActivityInner {
                store,
                instance: Uuid::new_v4().to_string(),
                lines: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                retry: RetryPolicy::with_attempts(3),
            }),
        }
    }

    pub async fn record(&self, line: impl Into<String>) {
        self.inner.lines.lock().await.push(line.into());
    }

    pub async fn pending(&self) -> usize {
        self.inner.lines.lock().await.len()
    }

    /// Write buffered lines as one object. Returns the key written, or
    /// `None` when there was nothing to flush.
    pub async fn flush(&self) -> Result<Option<String>> {
        let batch = std::mem::take(&mut *self.inner.lines.lock().await);
        if batch.is_empty() {
            return Ok(None);
        }

        let key = format!(
            "logs/{}.{}.{:03}",
            Utc::now().timestamp(),
            self.inner.instance,
            self.inner.seq.fetch_add(1, Ordering::SeqCst)
        );
        let mut text = batch.join("\n");
        text.push('\n');
        let body = Bytes::from(text);

        let store = &self.inner.store;
        let written = retry(&self.inner.retry, || async {
            Ok(store.put(&key, body.clone()).await?)
        })
        .await;
        match written {
            Ok(()) => Ok(Some(key)),
            Err(e) => {
                let mut lines = self.inner.lines.lock().await;
                let newer = std::mem::replace(&mut *lines, batch);
                lines.extend(newer);
                Err(e)
            }
        }
    }

    /// Flush every `interval` until `shutdown`, then flush once more.
    pub fn spawn_flush_loop(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = log.flush().await {
                            tracing::warn!(error = %e, "Activity flush failed");
                        }
                    }
                }
            }
            if let Err(e) = log.flush().await {
                tracing::warn!(error = %e, "Final activity flush failed");
            }
        })
    }
}
