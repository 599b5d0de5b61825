//! Cancellable periodic background tasks.
//!
//! Every housekeeping job (expiry sweep, rate-table eviction, auth-session
//! eviction) runs through [`spawn_periodic`]: the task runs once immediately,
//! then once per period, until the shared `CancellationToken` fires. An
//! in-flight run is dropped on cancellation, so tasks must tolerate being cut
//! off at any await point.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawn `task` on the runtime, starting now and repeating every `period`.
///
/// Ticks missed while a run overruns the period are skipped rather than
/// replayed in a burst. The returned handle completes once the loop has
/// observed `cancel`.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        // interval() panics on a zero period
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(task = name, period_secs = period.as_secs(), "Periodic task started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(task = name, "Periodic task tick");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = task() => {}
                    }
                }
            }
        }

        info!(task = name, "Periodic task stopped");
    })
}

/// Wait for each named task, logging any that panicked or was aborted.
///
/// Returns how many ended abnormally.
pub async fn join_logged(tasks: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task ended abnormally");
            failed += 1;
        }
    }
    failed
}
