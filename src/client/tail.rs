use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_LOG_SHIP_INTERVAL;
use crate::error::{ExecError, Result};
use crate::protocol::PullKeys;
use crate::retry::{retry, RetryPolicy};
use crate::store::{ObjectStore, StoreError};

#[derive(Debug, Clone)]
pub struct TailOptions {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_LOG_SHIP_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

async fn read_text(
    store: &dyn ObjectStore,
    key: &str,
    policy: &RetryPolicy,
) -> Result<Option<String>> {
    retry(policy, || async {
        match store.get(key).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).trim().to_string())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await
}

fn parse<T: std::str::FromStr>(key: &str, text: &str) -> Result<T> {
    text.parse()
        .map_err(|_| ExecError::Internal(format!("{} holds {:?}", key, text)))
}

/// Follow a pull-mode job's log straight from the store until its exit
/// object is published.
///
/// The size object doubles as the completion flag: once the bytes read so
/// far equal it, the exit object is read and returned.
pub async fn tail<F>(
    store: &dyn ObjectStore,
    keys: &PullKeys,
    options: &TailOptions,
    cancel: &CancellationToken,
    mut sink: F,
) -> Result<i32>
where
    F: FnMut(&[u8]),
{
    let mut range_start = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        if let Some(text) = read_text(store, &keys.size, &options.retry).await? {
            let size: u64 = parse(&keys.size, &text)?;
            if range_start == size {
                let exit = read_text(store, &keys.exit, &options.retry)
                    .await?
                    .ok_or_else(|| ExecError::Internal(format!("{} missing", keys.exit)))?;
                return parse(&keys.exit, &exit);
            }
            if range_start > size {
                return Err(ExecError::Internal(format!(
                    "read {} bytes past published size {}",
                    range_start, size
                )));
            }
        }

        let page = retry(&options.retry, || async {
            match store.get_range(&keys.log, range_start).await {
                Ok(data) => Ok(Some(data)),
                Err(StoreError::InvalidRange { .. } | StoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        match page {
            Some(data) => {
                sink(&data);
                range_start += data.len() as u64;
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;

    fn options() -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reads_finished_job() {
        let store = MemoryStore::new();
        let keys = PullKeys::for_job("a:1", "1.a");
        store.put(&keys.log, Bytes::from_static(b"hi\n")).await.unwrap();
        store.put(&keys.exit, Bytes::from_static(b"0")).await.unwrap();
        store.put(&keys.size, Bytes::from_static(b"3")).await.unwrap();

        let mut out = Vec::new();
        let exit = tail(&store, &keys, &options(), &CancellationToken::new(), |b| {
            out.extend_from_slice(b)
        })
        .await
        .unwrap();
        assert_eq!(exit, 0);
        assert_eq!(out, b"hi\n");
    }

    #[tokio::test]
    async fn follows_growing_log() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let keys = PullKeys::for_job("a:1", "2.b");

        let writer = {
            let store = store.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.put(&keys.log, Bytes::from_static(b"one\n")).await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.put(&keys.log, Bytes::from_static(b"one\ntwo\n")).await.unwrap();
                store.put(&keys.exit, Bytes::from_static(b"1")).await.unwrap();
                store.put(&keys.size, Bytes::from_static(b"8")).await.unwrap();
            })
        };

        let mut out = Vec::new();
        let exit = tail(store.as_ref(), &keys, &options(), &CancellationToken::new(), |b| {
            out.extend_from_slice(b)
        })
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(exit, 1);
        assert_eq!(out, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn empty_log_with_completion() {
        let store = MemoryStore::new();
        let keys = PullKeys::for_job("a:1", "3.c");
        store.put(&keys.exit, Bytes::from_static(b"1")).await.unwrap();
        store.put(&keys.size, Bytes::from_static(b"0")).await.unwrap();
        let exit = tail(&store, &keys, &options(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(exit, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let store = MemoryStore::new();
        let keys = PullKeys::for_job("a:1", "4.d");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = tail(&store, &keys, &options(), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }
}
