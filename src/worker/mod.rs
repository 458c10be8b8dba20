//! Worker side of the system: everything that runs after a job has been
//! handed off.
//!
//! - [`WorkerPool`]: bounded queue of encoded [`Event`]s, drained with
//!   limited concurrency
//! - [`Worker`]: decodes each event and either runs a job or sweeps
//! - [`JobRunner`]: executes one job, ships its log, publishes completion
//! - [`JobExecutor`]: the subprocess or rpc invoker itself
//!
//! # Execution Flow
//!
//! 1. The dispatcher invokes the pool with an `exec` event
//! 2. A pool task decodes it and calls [`JobRunner::run`]
//! 3. The executor streams output lines into the line queue while the
//!    shipper appends them to the spill file and uploads it
//! 4. After the last completion marker the final log is shipped, then
//!    exit and size are written
//!
//! # Security Note
//!
//! Subprocesses run unsandboxed as the server user.

pub mod executor;
pub mod job;
pub mod output;
pub mod panic;
pub mod pool;
pub mod rpc;
pub mod subprocess;
pub mod sweep;

use std::sync::Arc;

use async_trait::async_trait;

pub use executor::{ExecutionResult, JobExecutor};
pub use job::{JobOutcome, JobRunner};
pub use output::{InvocationMode, LineSink, StreamEvent, StreamKind};
pub use pool::{EventHandler, InvokeAck, Invoker, WorkerPool};
pub use rpc::{Registry, RpcContext, RpcResult};

use crate::error::Result;
use crate::event::Event;
use crate::store::ObjectStore;

/// Handles every event kind the pool carries.
pub struct Worker {
    runner: JobRunner,
    store: Arc<dyn ObjectStore>,
}

impl Worker {
    pub fn new(runner: JobRunner, store: Arc<dyn ObjectStore>) -> Self {
        Self { runner, store }
    }
}

#[async_trait]
impl EventHandler for Worker {
    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Exec(job) => {
                let outcome = self.runner.run(&job).await;
                if let Err(e) = &outcome {
                    tracing::error!(uid = %job.uid, auth_name = %job.auth_name, error = %e, "Job failed to publish");
                }
                outcome.map(|_| ())
            }
            Event::Sweep(sweep) => sweep::sweep_expired(self.store.as_ref(), sweep.cutoff)
                .await
                .map(|_| ()),
        }
    }
}
