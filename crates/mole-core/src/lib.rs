//! `mole-core`: configuration, shared error type and the domain types passed
//! between the repository, the scheduler and the sync executor.

pub mod action;
pub mod config;
pub mod error;
pub mod types;

pub use action::JobAction;
pub use error::{MoleError, Result};
pub use types::{
    job_id_for, task_id_from_job_id, ConnectionDescriptor, RunRecord, RunStatus,
    ScheduleFrequency, TaskDescriptor, JOB_ID_PREFIX,
};
