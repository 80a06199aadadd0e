//! Worker pool and background maintenance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Shared;
use super::execution::run_job;

/// Spawn `count` workers pulling from the shared ready queue.
pub(super) fn spawn_workers(shared: &Arc<Shared>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| tokio::spawn(worker(index, Arc::clone(shared))))
        .collect()
}

async fn worker(index: usize, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    info!(worker = index, "worker started");

    loop {
        let dispatch = tokio::select! {
            _ = shutdown.changed() => break,
            dispatch = shared.scheduler.dequeue() => match dispatch {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let job_id = dispatch.job_id;
        if let Err(e) = run_job(&shared, dispatch).await {
            error!(worker = index, %job_id, error = %e, "job execution failed");
        }
    }

    info!(worker = index, "worker stopped");
}

/// Periodically expire dead letters, archive old terminal jobs and drop
/// idle rate-limit state.
pub(super) fn spawn_sweeper(shared: &Arc<Shared>, period: Duration) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut shutdown = shared.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = shared.sweep(Utc::now()).await {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }
    })
}
