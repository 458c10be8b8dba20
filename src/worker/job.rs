use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::executor::JobExecutor;
use super::output::LineSink;
use crate::config::JobConfig;
use crate::error::{ExecError, Result};
use crate::event::AsyncEvent;
use crate::shipper::{CompletionPublisher, Destination, LogShipper, SpillFile};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub exit_code: i32,
    pub log_size: u64,
}

/// Runs one [`AsyncEvent`] end to end: execute, ship, publish.
#[derive(Clone)]
pub struct JobRunner {
    executor: JobExecutor,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    config: JobConfig,
}

impl JobRunner {
    pub fn new(
        executor: JobExecutor,
        store: Arc<dyn ObjectStore>,
        http: reqwest::Client,
        config: JobConfig,
    ) -> Self {
        Self {
            executor,
            store,
            http,
            config,
        }
    }

    /// Run the job to completion.
    ///
    /// The executor and the shipper run concurrently, joined by the line
    /// queue. If shipping fails the job is cancelled and the error is
    /// returned without publishing exit or size.
    pub async fn run(&self, event: &AsyncEvent) -> Result<JobOutcome> {
        let spill_dir = tempfile::tempdir()?;
        let spill = Arc::new(SpillFile::create(spill_dir.path(), self.config.max_log_bytes).await?);
        let destination = Destination::for_event(event, self.store.clone(), self.http.clone());

        let (sink, rx) = LineSink::channel();
        let expected = JobExecutor::mode(&event.job).completion_signals();
        let shipper = LogShipper::new(
            spill.clone(),
            destination.clone(),
            self.config.log_ship_interval,
            self.config.retry.clone(),
        );

        let cancel = CancellationToken::new();
        let shipping = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = shipper.run(rx, expected).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        let execution = self.executor.execute(event, sink, cancel).await;
        let log_size = shipping
            .await
            .map_err(|e| ExecError::Internal(format!("log shipper task failed: {}", e)))??;

        CompletionPublisher::new(&destination, &self.config.retry)
            .publish(execution.exit_code, log_size)
            .await?;

        let truncated = spill.is_truncated().await;
        tracing::info!(
            uid = %event.uid,
            exit_code = execution.exit_code,
            log_size,
            truncated,
            push = destination.is_push(),
            "Job published"
        );
        drop(spill_dir);
        Ok(JobOutcome {
            exit_code: execution.exit_code,
            log_size,
        })
    }
}
