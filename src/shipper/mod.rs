//! Log shipping for running jobs.
//!
//! Lines from the invoker are appended to a capped [`SpillFile`]. While the
//! job runs, the whole spill file is re-uploaded to the job's
//! [`Destination`] at most once per ship interval; after the last
//! completion marker one final ship runs, then [`CompletionPublisher`]
//! writes exit and size.
//!
//! Ships are serialized: a new one starts only after the previous upload
//! finished, so the visible log only ever grows.

pub mod destination;
pub mod publish;
pub mod spill;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use destination::{Destination, Slot};
pub use publish::CompletionPublisher;
pub use spill::{truncation_marker, AppendOutcome, SpillFile};

use crate::error::{ExecError, Result};
use crate::retry::RetryPolicy;
use crate::worker::output::StreamEvent;

/// Upload the spill file if it grew past `last_shipped`.
///
/// Returns the shipped length, or `None` when there was nothing new.
async fn ship_once(
    spill: Arc<SpillFile>,
    destination: Destination,
    retry: RetryPolicy,
    last_shipped: u64,
) -> Result<Option<u64>> {
    let size = spill.snapshot().await?;
    if size == last_shipped {
        return Ok(None);
    }
    let body = spill.read_prefix(size).await?;
    destination
        .write_with_retry(Slot::Log, Bytes::from(body), &retry)
        .await?;
    tracing::trace!(size, "Shipped log");
    Ok(Some(size))
}

pub struct LogShipper {
    spill: Arc<SpillFile>,
    destination: Destination,
    interval: Duration,
    retry: RetryPolicy,
    last_shipped: u64,
}

impl LogShipper {
    pub fn new(
        spill: Arc<SpillFile>,
        destination: Destination,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            spill,
            destination,
            interval,
            retry,
            last_shipped: 0,
        }
    }

    #[cfg(test)]
    pub fn last_shipped(&self) -> u64 {
        self.last_shipped
    }

    /// Ship now unless nothing changed since the last successful ship.
    /// Returns whether a write happened.
    pub async fn ship_now(&mut self) -> Result<bool> {
        let shipped = ship_once(
            self.spill.clone(),
            self.destination.clone(),
            self.retry.clone(),
            self.last_shipped,
        )
        .await?;
        if let Some(size) = shipped {
            self.last_shipped = size;
        }
        Ok(shipped.is_some())
    }

    /// Consume `rx` until `expected_signals` close markers have arrived,
    /// shipping along the way. Returns the final shipped log size.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<StreamEvent>,
        expected_signals: usize,
    ) -> Result<u64> {
        let mut closed = 0usize;
        let mut streams_done = expected_signals == 0;
        let mut last_ship = Instant::now();
        let mut in_flight: Option<JoinHandle<Result<Option<u64>>>> = None;

        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if streams_done && in_flight.is_none() {
                break;
            }

            tokio::select! {
                event = rx.recv(), if !streams_done => match event {
                    Some(StreamEvent::Line(line)) => {
                        self.spill.append(&line).await?;
                    }
                    Some(StreamEvent::Closed(kind)) => {
                        closed += 1;
                        tracing::debug!(stream = %kind, closed, expected_signals, "Stream closed");
                        if closed >= expected_signals {
                            streams_done = true;
                        }
                    }
                    None => {
                        tracing::warn!(closed, expected_signals, "Line queue closed before all streams finished");
                        streams_done = true;
                    }
                },
                joined = async {
                    match in_flight.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                    let shipped = joined
                        .map_err(|e| ExecError::Internal(format!("log ship task failed: {}", e)))??;
                    if let Some(size) = shipped {
                        self.last_shipped = size;
                    }
                    last_ship = Instant::now();
                }
                _ = ticker.tick() => {}
            }

            if !streams_done && in_flight.is_none() && last_ship.elapsed() >= self.interval {
                in_flight = Some(tokio::spawn(ship_once(
                    self.spill.clone(),
                    self.destination.clone(),
                    self.retry.clone(),
                    self.last_shipped,
                )));
            }
        }

        // Final ship, unconditional on the interval.
        self.ship_now().await?;
        Ok(self.last_shipped)
    }
}
