//! Startup recovery and periodic retention for the job table.

use crate::job_tracker::{JobTracker, RetentionPolicy, TrackerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fail the jobs a previous process left pending/running. Call once, before
/// any producer registers a job.
pub fn run_startup_recovery(tracker: &JobTracker) -> Result<usize, TrackerError> {
    info!("Recovering jobs orphaned by the previous run...");
    tracker.cleanup_orphaned_jobs_on_startup()
}

/// Spawn a task that applies `policy` every `interval` until `shutdown` is
/// cancelled. The first sweep happens one interval after spawning.
pub fn spawn_retention_loop(
    tracker: Arc<JobTracker>,
    policy: RetentionPolicy,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(
        "Job retention enabled: default {}h, {} per-type overrides, sweeping every {}s",
        policy.default_hours,
        policy.per_operation.len(),
        interval.as_secs()
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Job retention loop shutting down");
                    break;
                }
            }

            let sweep_tracker = tracker.clone();
            let sweep_policy = policy.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                sweep_tracker.cleanup_old_jobs_all(&sweep_policy)
            })
            .await;

            match outcome {
                Ok(Ok(count)) => {
                    if count > 0 {
                        info!("Retention sweep deleted {} finished jobs", count);
                    }
                }
                Ok(Err(e)) => {
                    error!("Retention sweep failed: {}", e);
                }
                Err(e) => {
                    error!("Retention sweep task panicked: {}", e);
                }
            }
        }
    })
}
