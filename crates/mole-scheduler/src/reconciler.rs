use std::collections::BTreeSet;
use std::sync::Arc;

use mole_core::config::{RECONCILE_INTERVAL_SECS, RELOAD_JOB_ID};
use mole_core::{task_id_from_job_id, JobAction, JOB_ID_PREFIX};
use mole_store::TaskRepository;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{Scheduler, UpsertOutcome};
use crate::error::Result;
use crate::trigger::Trigger;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<i64>,
    pub rescheduled: Vec<i64>,
    pub unchanged: Vec<i64>,
    pub removed: Vec<i64>,
    /// Tasks whose schedule has no trigger mapping.
    pub skipped: Vec<i64>,
}

/// Brings the scheduler's `dbtask_*` jobs in line with the task table.
pub struct Reconciler {
    repo: Arc<TaskRepository>,
    scheduler: Arc<Scheduler>,
}

impl Reconciler {
    pub fn new(repo: Arc<TaskRepository>, scheduler: Arc<Scheduler>) -> Self {
        Self { repo, scheduler }
    }

    /// Run the initial pass and install the periodic reload job.
    pub fn install(&self) -> Result<ReconcileReport> {
        let report = self.reconcile();
        self.scheduler.upsert_job(
            RELOAD_JOB_ID,
            JobAction::Reconcile,
            Trigger::Interval {
                period_secs: RECONCILE_INTERVAL_SECS,
            },
        )?;
        info!(
            job_id = RELOAD_JOB_ID,
            every_secs = RECONCILE_INTERVAL_SECS,
            "reload job installed"
        );
        Ok(report)
    }

    /// One diff-and-apply pass.
    ///
    /// Jobs outside the `dbtask_` namespace are never touched. A store outage
    /// reads as zero tasks, so every task job is removed until it recovers.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut desired: Vec<(i64, Trigger)> = Vec::new();
        for task in self.repo.list_scheduled_tasks() {
            match Trigger::for_frequency(&task.schedule) {
                Some(trigger) => desired.push((task.task_id, trigger)),
                None => {
                    warn!(
                        task_id = task.task_id,
                        schedule = %task.schedule,
                        "unsupported schedule frequency, task not scheduled"
                    );
                    report.skipped.push(task.task_id);
                }
            }
        }
        let wanted: BTreeSet<i64> = desired.iter().map(|(id, _)| *id).collect();

        let live: Vec<i64> = self
            .scheduler
            .job_ids()
            .iter()
            .filter(|id| id.starts_with(JOB_ID_PREFIX))
            .filter_map(|id| task_id_from_job_id(id))
            .collect();

        for task_id in live.into_iter().filter(|id| !wanted.contains(id)) {
            match self.scheduler.remove(task_id) {
                Ok(()) => report.removed.push(task_id),
                Err(e) => warn!(task_id, error = %e, "failed to remove stale job"),
            }
        }

        for (task_id, trigger) in desired {
            match self.scheduler.upsert(task_id, trigger) {
                Ok(UpsertOutcome::Added) => report.added.push(task_id),
                Ok(UpsertOutcome::Rescheduled) => report.rescheduled.push(task_id),
                Ok(UpsertOutcome::Unchanged) => report.unchanged.push(task_id),
                Err(e) => {
                    warn!(task_id, error = %e, "failed to schedule task");
                    report.skipped.push(task_id);
                }
            }
        }

        info!(
            added = report.added.len(),
            rescheduled = report.rescheduled.len(),
            unchanged = report.unchanged.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "reconciliation complete"
        );
        report
    }
}
