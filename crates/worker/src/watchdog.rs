//! Periodic queue sweep.
//!
//! Recovers from a lost dispatch trigger: if jobs are pending while no
//! worker is running, [`ExecutionQueue::sweep`] starts one. Runs until
//! the cancellation token fires.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::queue::ExecutionQueue;

/// Spawn the watchdog loop. The first sweep happens one `interval` after
/// spawning.
pub fn spawn_watchdog(
    queue: ExecutionQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "Queue watchdog started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Queue watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = queue.snapshot();
                    tracing::debug!(
                        pending = snapshot.pending,
                        in_flight = snapshot.in_flight,
                        "Queue sweep",
                    );
                    queue.sweep();
                }
            }
        }
    })
}
