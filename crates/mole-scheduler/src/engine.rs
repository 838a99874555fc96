use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use mole_core::{job_id_for, JobAction};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::trigger::Trigger;

/// Snapshot of one live job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub action: JobAction,
    pub trigger: Trigger,
    pub next_fire: DateTime<Utc>,
}

/// What `upsert` did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    /// Present with an equal trigger; nothing changed.
    Unchanged,
    /// Present with a different trigger; trigger and next fire replaced.
    Rescheduled,
}

/// What `fire` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Handed to the dispatcher.
    Dispatched,
    /// A previous fire of the same job is still running.
    AlreadyRunning,
    UnknownJob,
    /// The scheduler has been stopped.
    Stopped,
    /// The dispatcher queue is full or closed.
    Dropped,
}

/// Marks a job id as in flight. Dropping it ends the run.
///
/// Held by whoever executes the job (dispatcher task or HTTP trigger) until
/// the run is over, including on panic.
#[derive(Debug)]
pub struct InFlightGuard {
    job_id: String,
    in_flight: Arc<DashSet<String>>,
}

impl InFlightGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.job_id);
        debug!(job_id = %self.job_id, "run finished, slot released");
    }
}

/// A job handed to the dispatcher by [`Scheduler::fire`].
#[derive(Debug)]
pub struct FiredJob {
    pub job_id: String,
    pub action: JobAction,
    pub guard: InFlightGuard,
}

/// Owns the live job registry and the scheduling clock.
///
/// Lifecycle: [`Scheduler::new`] → [`Scheduler::start`] → [`Scheduler::stop`].
/// All registry mutations (`upsert`, `remove`, due-job collection) happen
/// under a single mutex; execution happens elsewhere, after the lock is
/// released.
pub struct Scheduler {
    jobs: Mutex<BTreeMap<String, ScheduledJob>>,
    in_flight: Arc<DashSet<String>>,
    /// Fired jobs are sent here for dispatch.
    fired_tx: mpsc::Sender<FiredJob>,
    shutdown_tx: watch::Sender<bool>,
    tick: Duration,
}

impl Scheduler {
    /// Create a stopped scheduler with an empty registry.
    ///
    /// The sender is used non-blocking (`try_send`) so the clock is never
    /// stalled by a slow dispatcher.
    pub fn new(fired_tx: mpsc::Sender<FiredJob>, tick: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            in_flight: Arc::new(DashSet::new()),
            fired_tx,
            shutdown_tx,
            tick,
        }
    }

    /// Schedule a sync job for `task_id`, or reschedule it if the trigger
    /// changed.
    pub fn upsert(&self, task_id: i64, trigger: Trigger) -> Result<UpsertOutcome> {
        self.upsert_job(&job_id_for(task_id), JobAction::Sync { task_id }, trigger)
    }

    /// Add or update an arbitrary job.
    ///
    /// Equal trigger → no-op (next fire preserved). Different trigger → the
    /// trigger and next fire are replaced in one step; a run already in
    /// flight is left alone.
    pub fn upsert_job(
        &self,
        job_id: &str,
        action: JobAction,
        trigger: Trigger,
    ) -> Result<UpsertOutcome> {
        self.upsert_job_at(job_id, action, trigger, Utc::now())
    }

    pub(crate) fn upsert_job_at(
        &self,
        job_id: &str,
        action: JobAction,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut jobs = self.registry();

        if let Some(existing) = jobs.get_mut(job_id) {
            if existing.trigger == trigger {
                debug!(%job_id, %trigger, "trigger unchanged");
                existing.action = action;
                return Ok(UpsertOutcome::Unchanged);
            }
            let next_fire = next_fire_for(job_id, &trigger, now)?;
            info!(%job_id, old = %existing.trigger, new = %trigger, %next_fire, "job rescheduled");
            existing.trigger = trigger;
            existing.action = action;
            existing.next_fire = next_fire;
            return Ok(UpsertOutcome::Rescheduled);
        }

        let next_fire = next_fire_for(job_id, &trigger, now)?;
        jobs.insert(
            job_id.to_string(),
            ScheduledJob {
                job_id: job_id.to_string(),
                action,
                trigger,
                next_fire,
            },
        );
        info!(%job_id, %trigger, %next_fire, "job added");
        Ok(UpsertOutcome::Added)
    }

    /// Cancel future fires of the task's job. A run in flight completes.
    pub fn remove(&self, task_id: i64) -> Result<()> {
        self.remove_job(&job_id_for(task_id))
    }

    /// Remove a job by id. Returns `JobNotFound` if it is not scheduled.
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        if self.registry().remove(job_id).is_none() {
            return Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        info!(%job_id, "job removed");
        Ok(())
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.registry().get(job_id).cloned()
    }

    /// Snapshot of every live job, ordered by id.
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.registry().values().cloned().collect()
    }

    /// Ids of every live job, ordered.
    pub fn job_ids(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.in_flight.contains(job_id)
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Claim the single-flight slot for `job_id`.
    ///
    /// `None` if a run with that id is already in flight. Used by the clock
    /// and by ad hoc triggers, so both paths share one slot per task.
    pub fn try_acquire(&self, job_id: &str) -> Option<InFlightGuard> {
        if !self.in_flight.insert(job_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            job_id: job_id.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Fire a scheduled job now, without touching its next fire time.
    pub fn fire(&self, job_id: &str) -> FireOutcome {
        let action = match self.registry().get(job_id) {
            Some(job) => job.action,
            None => {
                warn!(%job_id, "fire requested for unknown job");
                return FireOutcome::UnknownJob;
            }
        };
        self.dispatch(job_id, action)
    }

    /// Fire every job whose next fire time is at or before `now` and advance
    /// it. Returns the number of jobs found due.
    pub fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<(String, JobAction)> = {
            let mut jobs = self.registry();
            let mut due = Vec::new();
            for job in jobs.values_mut().filter(|j| j.next_fire <= now) {
                match job.trigger.next_fire_after(now) {
                    Some(next) => job.next_fire = next,
                    None => {
                        error!(job_id = %job.job_id, trigger = %job.trigger, "trigger exhausted");
                        continue;
                    }
                }
                due.push((job.job_id.clone(), job.action));
            }
            due
        };

        let count = due.len();
        for (job_id, action) in due {
            self.dispatch(&job_id, action);
        }
        count
    }

    /// Spawn the clock. Ticks until [`Scheduler::stop`] is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            info!(tick_ms = this.tick.as_millis() as u64, "scheduler clock started");

            let mut interval = tokio::time::interval(this.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.tick_at(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("scheduler clock shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop firing new jobs. Runs already in flight are not awaited.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    // --- private helpers ---------------------------------------------------

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, job_id: &str, action: JobAction) -> FireOutcome {
        if self.is_stopped() {
            debug!(%job_id, "scheduler stopped, not firing");
            return FireOutcome::Stopped;
        }

        let Some(guard) = self.try_acquire(job_id) else {
            warn!(%job_id, "previous run still in progress, skipping this fire");
            return FireOutcome::AlreadyRunning;
        };

        let fired = FiredJob {
            job_id: job_id.to_string(),
            action,
            guard,
        };
        // try_send never blocks the clock; on failure the guard is dropped
        // with the job and the slot is released.
        match self.fired_tx.try_send(fired) {
            Ok(()) => {
                info!(%job_id, "job fired");
                FireOutcome::Dispatched
            }
            Err(e) => {
                warn!(%job_id, "dispatch channel full or closed, fire dropped: {e}");
                FireOutcome::Dropped
            }
        }
    }
}

fn next_fire_for(job_id: &str, trigger: &Trigger, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    trigger.next_fire_after(now).ok_or_else(|| {
        SchedulerError::InvalidTrigger(format!("{trigger} for {job_id} never fires"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    const HOURLY: Trigger = Trigger::Interval { period_secs: 3600 };
    const DAILY: Trigger = Trigger::Cron { day_of_week: None, hour: 2, minute: 0 };

    fn scheduler() -> (Scheduler, mpsc::Receiver<FiredJob>) {
        let (tx, rx) = mpsc::channel(16);
        (Scheduler::new(tx, Duration::from_millis(10)), rx)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap()
    }

    #[test]
    fn upsert_add_unchanged_reschedule() {
        let (s, _rx) = scheduler();
        let sync = JobAction::Sync { task_id: 7 };
        assert_eq!(s.upsert_job_at("dbtask_7", sync, HOURLY, t0()).unwrap(), UpsertOutcome::Added);
        assert_eq!(
            s.upsert_job_at("dbtask_7", sync, HOURLY, t0() + chrono::Duration::minutes(5)).unwrap(),
            UpsertOutcome::Unchanged
        );
        // Unchanged keeps the original next fire.
        assert_eq!(
            s.get("dbtask_7").unwrap().next_fire,
            t0() + chrono::Duration::hours(1)
        );

        assert_eq!(s.upsert_job_at("dbtask_7", sync, DAILY, t0()).unwrap(), UpsertOutcome::Rescheduled);
        let job = s.get("dbtask_7").unwrap();
        assert_eq!(job.trigger, DAILY);
        assert_eq!(job.next_fire, Utc.with_ymd_and_hms(2026, 3, 5, 2, 0, 0).unwrap());
        assert_eq!(s.jobs().len(), 1);
    }

    #[test]
    fn upsert_rejects_trigger_that_never_fires() {
        let (s, _rx) = scheduler();
        let bad = Trigger::Cron { day_of_week: Some(Weekday::Mon), hour: 99, minute: 0 };
        assert!(matches!(s.upsert(1, bad), Err(SchedulerError::InvalidTrigger(_))));
        assert!(s.job_ids().is_empty());
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let (s, _rx) = scheduler();
        s.upsert(3, HOURLY).unwrap();
        s.remove(3).unwrap();
        assert!(matches!(s.remove(3), Err(SchedulerError::JobNotFound { .. })));
        assert!(s.job_ids().is_empty());
    }

    #[test]
    fn tick_fires_due_jobs_and_advances() {
        let (s, mut rx) = scheduler();
        s.upsert_job_at("dbtask_1", JobAction::Sync { task_id: 1 }, HOURLY, t0()).unwrap();
        s.upsert_job_at("dbtask_2", JobAction::Sync { task_id: 2 }, DAILY, t0()).unwrap();

        assert_eq!(s.tick_at(t0() + chrono::Duration::minutes(59)), 0);
        assert_eq!(s.tick_at(t0() + chrono::Duration::hours(1)), 1);

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.job_id, "dbtask_1");
        assert_eq!(fired.action, JobAction::Sync { task_id: 1 });
        assert!(rx.try_recv().is_err());
        assert_eq!(
            s.get("dbtask_1").unwrap().next_fire,
            t0() + chrono::Duration::hours(2)
        );
    }

    #[test]
    fn single_flight_per_job() {
        let (s, mut rx) = scheduler();
        s.upsert(7, HOURLY).unwrap();

        assert_eq!(s.fire("dbtask_7"), FireOutcome::Dispatched);
        let first = rx.try_recv().unwrap();
        assert!(s.is_running("dbtask_7"));

        // Still in flight: neither a manual fire nor a due tick starts another.
        assert_eq!(s.fire("dbtask_7"), FireOutcome::AlreadyRunning);
        assert!(s.try_acquire("dbtask_7").is_none());
        s.tick_at(Utc::now() + chrono::Duration::hours(2));
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(!s.is_running("dbtask_7"));
        assert_eq!(s.fire("dbtask_7"), FireOutcome::Dispatched);
    }

    #[test]
    fn remove_does_not_cancel_in_flight_run() {
        let (s, mut rx) = scheduler();
        s.upsert(7, HOURLY).unwrap();
        s.fire("dbtask_7");
        let fired = rx.try_recv().unwrap();

        s.remove(7).unwrap();
        assert!(s.is_running("dbtask_7"));
        assert_eq!(s.fire("dbtask_7"), FireOutcome::UnknownJob);
        drop(fired);
        assert!(!s.is_running("dbtask_7"));
    }

    #[test]
    fn reschedule_keeps_in_flight_run_and_slot() {
        let (s, mut rx) = scheduler();
        s.upsert(7, HOURLY).unwrap();
        s.fire("dbtask_7");
        let fired = rx.try_recv().unwrap();

        assert_eq!(s.upsert(7, DAILY).unwrap(), UpsertOutcome::Rescheduled);
        assert_eq!(s.get("dbtask_7").unwrap().trigger, DAILY);
        assert!(s.is_running("dbtask_7"));
        assert_eq!(s.fire("dbtask_7"), FireOutcome::AlreadyRunning);
        assert!(rx.try_recv().is_err());

        drop(fired);
        assert!(!s.is_running("dbtask_7"));
        assert_eq!(s.fire("dbtask_7"), FireOutcome::Dispatched);
        assert_eq!(rx.try_recv().unwrap().action, JobAction::Sync { task_id: 7 });
    }

    #[test]
    fn full_queue_releases_the_slot() {
        let (tx, _rx) = mpsc::channel(1);
        let s = Scheduler::new(tx, Duration::from_secs(1));
        s.upsert(1, HOURLY).unwrap();
        s.upsert(2, HOURLY).unwrap();
        assert_eq!(s.fire("dbtask_1"), FireOutcome::Dispatched);
        assert_eq!(s.fire("dbtask_2"), FireOutcome::Dropped);
        assert!(!s.is_running("dbtask_2"));
    }

    #[test]
    fn stopped_scheduler_does_not_fire() {
        let (s, mut rx) = scheduler();
        s.upsert(1, HOURLY).unwrap();
        s.stop();
        assert!(s.is_stopped());
        assert_eq!(s.fire("dbtask_1"), FireOutcome::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clock_fires_and_stops() {
        let (tx, mut rx) = mpsc::channel(16);
        let s = Arc::new(Scheduler::new(tx, Duration::from_millis(10)));
        s.upsert_job_at(
            "dbtask_5",
            JobAction::Sync { task_id: 5 },
            HOURLY,
            Utc::now() - chrono::Duration::hours(2),
        )
        .unwrap();

        let handle = s.start();
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("clock should fire the overdue job")
            .unwrap();
        assert_eq!(fired.job_id, "dbtask_5");

        s.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("clock should exit after stop")
            .unwrap();
    }
}
