//! `mole-scheduler`: in-memory job scheduler and task reconciliation.
//!
//! # Overview
//!
//! The [`Scheduler`] owns the live set of jobs. A clock task started with
//! [`Scheduler::start`] checks for due jobs every tick and hands each one to
//! the dispatcher as a [`FiredJob`] over an mpsc channel. Every fired job
//! carries an [`InFlightGuard`]; while it is alive the same job id cannot
//! fire again (single-flight).
//!
//! The [`Reconciler`] diffs the task table against the live job set every
//! five minutes and applies the minimal set of upserts and removals.
//!
//! # Trigger variants
//!
//! | Frequency | Trigger                          |
//! |-----------|----------------------------------|
//! | `hourly`  | `Interval` every 3600 s          |
//! | `daily`   | `Cron` 02:00 UTC                 |
//! | `weekly`  | `Cron` Monday 02:00 UTC          |
//! | `never`   | no job                           |

pub mod engine;
pub mod error;
pub mod reconciler;
pub mod trigger;

pub use engine::{FireOutcome, FiredJob, InFlightGuard, ScheduledJob, Scheduler, UpsertOutcome};
pub use error::{Result, SchedulerError};
pub use reconciler::{ReconcileReport, Reconciler};
pub use trigger::Trigger;
