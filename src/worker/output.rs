use tokio::sync::mpsc;

/// Capacity of the per-job line queue between the invoker and the shipper.
pub const LINE_QUEUE_CAPACITY: usize = 128;

/// Completion signals a subprocess job produces: stdout and stderr closing.
pub const SUBPROCESS_COMPLETION_SIGNALS: usize = 2;

/// Completion signals an rpc job produces: the procedure's output stream,
/// a synthetic stderr close, and the launch-result marker sent once the
/// procedure call has returned (or failed to start).
pub const RPC_COMPLETION_SIGNALS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Launch,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
            StreamKind::Launch => write!(f, "launch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One output line, without its terminator.
    Line(String),
    /// End-of-stream marker.
    Closed(StreamKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    Subprocess,
    Rpc,
}

impl InvocationMode {
    pub fn completion_signals(self) -> usize {
        match self {
            InvocationMode::Subprocess => SUBPROCESS_COMPLETION_SIGNALS,
            InvocationMode::Rpc => RPC_COMPLETION_SIGNALS,
        }
    }
}

/// Line-emit handle given to readers and procedures.
///
/// Sends never fail loudly: if the shipper has gone away the job is already
/// failing and the lines have nowhere to go.
#[derive(Debug, Clone)]
pub struct LineSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl LineSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Channel pair sized for one job.
    pub fn channel() -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let _ = self.tx.send(StreamEvent::Line(line.into())).await;
    }

    pub async fn close(&self, kind: StreamKind) {
        let _ = self.tx.send(StreamEvent::Closed(kind)).await;
    }
}
