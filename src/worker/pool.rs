use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::Event;

/// Acknowledgement from the invocation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeAck {
    /// Queued for execution.
    Accepted,
    /// Queue full, try again later.
    Throttled,
    /// Workers are shutting down.
    Unavailable,
}

impl InvokeAck {
    /// Status code the invocation layer answered with.
    pub fn status_code(self) -> u16 {
        match self {
            InvokeAck::Accepted => 202,
            InvokeAck::Throttled => 429,
            InvokeAck::Unavailable => 503,
        }
    }
}

/// Asynchronous hand-off of an [`Event`] to the executor side.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, event: &Event) -> Result<InvokeAck>;
}

/// Consumer side of the pool.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Bounded queue of encoded events drained by at most `concurrency` tasks.
///
/// Events are encoded on submit and decoded by the worker, so the producer
/// and the consumer only share the wire format.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WorkerPool {
    /// Start the dispatch loop. The returned handle completes once
    /// `shutdown` fires and every in-flight event has finished.
    pub fn start(
        handler: Arc<dyn EventHandler>,
        concurrency: usize,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(Self::dispatch_loop(
            handler,
            rx,
            concurrency.max(1),
            shutdown,
        ));
        (Self { tx }, handle)
    }

    async fn dispatch_loop(
        handler: Arc<dyn EventHandler>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            Self::spawn_event(&handler, &permits, &mut tasks, payload).await;
        }

        // Everything already queued was acknowledged as accepted, so it runs
        // to completion; only new submissions are refused.
        rx.close();
        let mut queued = 0usize;
        while let Some(payload) = rx.recv().await {
            queued += 1;
            Self::spawn_event(&handler, &permits, &mut tasks, payload).await;
        }
        tracing::info!(in_flight = tasks.len(), queued, "Worker pool draining");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!("Worker pool stopped");
    }

    /// Wait for a free slot, then run one encoded event.
    async fn spawn_event(
        handler: &Arc<dyn EventHandler>,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        payload: Vec<u8>,
    ) {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(error = %e, "Worker permits closed, dropping event");
                return;
            }
        };

        while let Some(joined) = tasks.try_join_next() {
            log_join(joined);
        }

        let handler = handler.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let event = match Event::decode(&payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable event");
                    return;
                }
            };
            let kind = event.kind();
            if let Err(e) = handler.handle(event).await {
                tracing::error!(kind, error = %e, "Event handling failed");
            }
        });
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Worker task aborted");
    }
}

#[async_trait]
impl Invoker for WorkerPool {
    async fn invoke(&self, event: &Event) -> Result<InvokeAck> {
        let payload = event.encode()?;
        let ack = match self.tx.try_send(payload) {
            Ok(()) => InvokeAck::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => InvokeAck::Throttled,
            Err(mpsc::error::TrySendError::Closed(_)) => InvokeAck::Unavailable,
        };
        tracing::debug!(kind = event.kind(), ack = ?ack, "Invoked");
        Ok(ack)
    }
}
