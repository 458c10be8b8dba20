use bytes::Bytes;

use super::destination::{Destination, Slot};
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Writes the completion objects once the final log ship has succeeded.
///
/// Exit goes first: readers treat the size object as "exit is readable".
#[derive(Debug)]
pub struct CompletionPublisher<'a> {
    destination: &'a Destination,
    retry: &'a RetryPolicy,
}

impl<'a> CompletionPublisher<'a> {
    pub fn new(destination: &'a Destination, retry: &'a RetryPolicy) -> Self {
        Self { destination, retry }
    }

    pub async fn publish(&self, exit_code: i32, log_size: u64) -> Result<()> {
        self.destination
            .write_with_retry(Slot::Exit, Bytes::from(exit_code.to_string()), self.retry)
            .await?;
        self.destination
            .write_with_retry(Slot::Size, Bytes::from(log_size.to_string()), self.retry)
            .await?;
        tracing::debug!(exit_code, log_size, "Published completion");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PullKeys;
    use crate::store::{MemoryStore, ObjectStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_exit_and_size() {
        let store = Arc::new(MemoryStore::new());
        let keys = PullKeys::for_job("a:1", "1.f");
        let dest = Destination::Pull {
            store: store.clone(),
            keys: keys.clone(),
        };
        let retry = RetryPolicy::default();
        CompletionPublisher::new(&dest, &retry)
            .publish(1, 42)
            .await
            .unwrap();
        assert_eq!(store.get(&keys.exit).await.unwrap(), "1");
        assert_eq!(store.get(&keys.size).await.unwrap(), "42");
    }
}
