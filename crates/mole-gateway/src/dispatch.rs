//! Dispatcher: turns fired jobs into work.
//!
//! Every fired job runs on its own tokio task holding the job's in-flight
//! guard, so a long transfer never blocks the clock or other tasks and the
//! single-flight slot is released only when the run is over.

use std::sync::Arc;

use mole_core::JobAction;
use mole_scheduler::{FiredJob, Reconciler};
use mole_sync::{RunOutcome, SyncExecutor};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Consume fired jobs until every sender is gone.
pub async fn run(
    mut fired_rx: mpsc::Receiver<FiredJob>,
    executor: Arc<SyncExecutor>,
    reconciler: Arc<Reconciler>,
) {
    while let Some(job) = fired_rx.recv().await {
        tokio::spawn(handle(job, Arc::clone(&executor), Arc::clone(&reconciler)));
    }
    info!("dispatcher stopped: fired-job channel closed");
}

async fn handle(job: FiredJob, executor: Arc<SyncExecutor>, reconciler: Arc<Reconciler>) {
    let FiredJob {
        job_id,
        action,
        guard,
    } = job;

    match action {
        JobAction::Sync { task_id } => match executor.run(task_id).await {
            RunOutcome::Stale => debug!(%job_id, "stale fire, nothing recorded"),
            RunOutcome::Completed(record) => info!(
                %job_id,
                status = %record.status,
                elapsed_ms = (record.end_time - record.start_time).num_milliseconds(),
                "scheduled sync finished"
            ),
        },
        JobAction::Reconcile => {
            // rusqlite is blocking
            if let Err(e) = tokio::task::spawn_blocking(move || reconciler.reconcile()).await {
                error!(%job_id, "reconciliation panicked: {e}");
            }
        }
    }

    drop(guard);
}
