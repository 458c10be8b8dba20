use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal cuts the drain short.
pub const FORCED_EXIT_CODE: i32 = 130;

struct Signals {
    term: Signal,
    int: Signal,
}

impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }
}

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// Cancellation starts a drain: the dispatcher stops accepting requests,
/// queued and running jobs finish and publish, and the activity log is
/// flushed. A second signal during the drain exits the process at once.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut signals = match Signals::install() {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        let name = signals.next().await;
        tracing::info!(signal = name, "Shutting down, waiting for running jobs");
        trigger.cancel();

        let name = signals.next().await;
        tracing::warn!(signal = name, "Second signal received, exiting without draining");
        std::process::exit(FORCED_EXIT_CODE);
    });

    token
}
