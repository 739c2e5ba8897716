//! The periodic driver.
//!
//! One background task ticks at the configured interval and runs a full
//! poll cycle per tick. Cancellation is observed between cycles only: an
//! in-flight cycle always runs to completion, so shutdown can never leave
//! a cursor half-advanced.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

use crate::engine::Engine;

/// Handle to the running poller task.
pub struct PollerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Request shutdown and wait for the current cycle (if any) to finish.
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.cancel_tx.send(());
        self.join.await
    }
}

/// Spawn the poll loop. The first cycle runs immediately, then once per
/// `interval`. Ticks that land while a cycle is still running are skipped,
/// so a feed is never in two cycles at once.
pub fn spawn_poller(engine: Arc<Engine>, interval: Duration) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Poller started");

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("Poller shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = engine.poll_once().await;
                    if summary.feeds > 0 {
                        debug!(
                            feeds = summary.feeds,
                            delivered = summary.delivered,
                            failed = summary.failed_feeds,
                            "Cycle complete"
                        );
                    }
                }
            }
        }
    });

    PollerHandle { cancel_tx, join }
}
