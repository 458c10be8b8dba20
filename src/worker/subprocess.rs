use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::output::{LineSink, StreamKind};

/// How long readers may keep draining after the child is gone. A grandchild
/// that inherited the pipes can otherwise hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one subprocess run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubprocessExit {
    pub exit_code: i32,
    pub timed_out: bool,
}

pub(crate) fn describe_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs >= 60 && secs % 60 == 0 && timeout.subsec_nanos() == 0 {
        format!("timeout after {} minutes", secs / 60)
    } else {
        format!("timeout after {:?}", timeout)
    }
}

/// Spawn `argv` with piped output and stream both pipes into `sink`
/// line by line. Exactly one close marker is sent per stream.
pub async fn run_subprocess(
    argv: &[String],
    timeout: Duration,
    sink: LineSink,
    cancel: CancellationToken,
) -> SubprocessExit {
    let Some((program, args)) = argv.split_first() else {
        sink.emit("error: empty argv").await;
        sink.close(StreamKind::Stdout).await;
        sink.close(StreamKind::Stderr).await;
        return SubprocessExit {
            exit_code: 1,
            timed_out: false,
        };
    };

    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Failed to start subprocess");
            sink.emit(format!("error: failed to start {}: {}", program, e))
                .await;
            sink.close(StreamKind::Stdout).await;
            sink.close(StreamKind::Stderr).await;
            return SubprocessExit {
                exit_code: 1,
                timed_out: false,
            };
        }
    };

    let mut readers: Vec<(StreamKind, JoinHandle<()>)> = Vec::with_capacity(2);
    match child.stdout.take() {
        Some(out) => readers.push((
            StreamKind::Stdout,
            tokio::spawn(read_lines(out, StreamKind::Stdout, sink.clone())),
        )),
        None => sink.close(StreamKind::Stdout).await,
    }
    match child.stderr.take() {
        Some(err) => readers.push((
            StreamKind::Stderr,
            tokio::spawn(read_lines(err, StreamKind::Stderr, sink.clone())),
        )),
        None => sink.close(StreamKind::Stderr).await,
    }

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let exit_code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => 0,
            Ok(status) => {
                tracing::debug!(program = %program, status = %status, "Subprocess exited unsuccessfully");
                1
            }
            Err(e) => {
                tracing::warn!(program = %program, error = %e, "Failed to wait on subprocess");
                1
            }
        },
        _ = tokio::time::sleep_until(deadline) => {
            timed_out = true;
            tracing::warn!(program = %program, timeout = ?timeout, "Subprocess timed out, killing");
            sink.emit(describe_timeout(timeout)).await;
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill subprocess");
            }
            let _ = child.wait().await;
            1
        }
        _ = cancel.cancelled() => {
            tracing::warn!(program = %program, "Subprocess cancelled, killing");
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill subprocess");
            }
            let _ = child.wait().await;
            1
        }
    };

    let grace_end = Instant::now() + READER_GRACE;
    for (kind, mut handle) in readers {
        if tokio::time::timeout_at(grace_end, &mut handle).await.is_err() {
            tracing::warn!(stream = %kind, "Output pipe still open after exit, abandoning reader");
            handle.abort();
            sink.close(kind).await;
        }
    }

    SubprocessExit {
        exit_code,
        timed_out,
    }
}

/// Forward complete lines from `reader`. Bytes after the last newline are
/// dropped at end of stream.
async fn read_lines<R>(reader: R, kind: StreamKind, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) if buf.last() == Some(&b'\n') => {
                buf.pop();
                sink.emit(String::from_utf8_lossy(&buf).into_owned()).await;
            }
            Ok(n) => {
                tracing::debug!(stream = %kind, bytes = n, "Dropping unterminated final line");
                break;
            }
            Err(e) => {
                tracing::warn!(stream = %kind, error = %e, "Read error on output pipe");
                break;
            }
        }
    }
    sink.close(kind).await;
}
