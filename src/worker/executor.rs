use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::output::{InvocationMode, LineSink, StreamKind};
use super::panic::catch_panic;
use super::rpc::{Registry, RpcContext};
use super::subprocess::{describe_timeout, run_subprocess};
use crate::event::{AsyncEvent, JobSpec};

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub uid: String,
    /// 0 on success, 1 on any failure.
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Runs one job in whichever mode it asks for, streaming its output into a
/// [`LineSink`] and reporting a normalized exit code.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    registry: Registry,
    timeout: Duration,
}

impl JobExecutor {
    pub fn new(registry: Registry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn mode(job: &JobSpec) -> InvocationMode {
        match job {
            JobSpec::Subprocess { .. } => InvocationMode::Subprocess,
            JobSpec::Rpc { .. } => InvocationMode::Rpc,
        }
    }

    /// Execute the job. All completion markers for the job's mode have been
    /// sent on `sink` by the time this returns.
    pub async fn execute(
        &self,
        event: &AsyncEvent,
        sink: LineSink,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(uid = %event.uid, auth_name = %event.auth_name, mode = ?Self::mode(&event.job), "Executing job");

        let (exit_code, timed_out) = match &event.job {
            JobSpec::Subprocess { argv } => {
                let exit = run_subprocess(argv, self.timeout, sink, cancel).await;
                (exit.exit_code, exit.timed_out)
            }
            JobSpec::Rpc { name, args } => self.run_rpc(event, name, args, sink, cancel).await,
        };

        tracing::info!(uid = %event.uid, exit_code, timed_out, "Job completed");
        ExecutionResult {
            uid: event.uid.clone(),
            exit_code,
            timed_out,
        }
    }

    async fn run_rpc(
        &self,
        event: &AsyncEvent,
        name: &str,
        args: &str,
        sink: LineSink,
        cancel: CancellationToken,
    ) -> (i32, bool) {
        let mut timed_out = false;
        let exit_code = match self.registry.get(name) {
            None => {
                tracing::warn!(uid = %event.uid, rpc = name, "Unknown procedure");
                sink.emit(format!("error: rpc not found: {}", name)).await;
                1
            }
            Some(handler) => {
                let ctx = RpcContext {
                    uid: event.uid.clone(),
                    auth_name: event.auth_name.clone(),
                    cancel: cancel.child_token(),
                };
                let call = catch_panic(handler(ctx.clone(), sink.clone(), args.to_string()));
                let outcome = tokio::select! {
                    outcome = tokio::time::timeout(self.timeout, call) => outcome,
                    _ = cancel.cancelled() => {
                        ctx.cancel.cancel();
                        Ok(Ok(Err("cancelled".into())))
                    }
                };
                match outcome {
                    Ok(Ok(Ok(()))) => 0,
                    Ok(Ok(Err(e))) => {
                        tracing::info!(uid = %event.uid, rpc = name, error = %e, "Procedure failed");
                        sink.emit(format!("error: {}", e)).await;
                        1
                    }
                    Ok(Err(panic)) => {
                        tracing::error!(uid = %event.uid, rpc = name, message = %panic.message, "Procedure panicked");
                        sink.emit(format!("panic: {}", panic.message)).await;
                        sink.emit(panic.backtrace).await;
                        1
                    }
                    Err(_) => {
                        timed_out = true;
                        ctx.cancel.cancel();
                        tracing::warn!(uid = %event.uid, rpc = name, timeout = ?self.timeout, "Procedure timed out");
                        sink.emit(describe_timeout(self.timeout)).await;
                        1
                    }
                }
            }
        };

        // The procedure's own stream, stderr, and the launch result.
        sink.close(StreamKind::Stdout).await;
        sink.close(StreamKind::Stderr).await;
        sink.close(StreamKind::Launch).await;
        (exit_code, timed_out)
    }
}
