use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger can never fire (e.g. an out-of-range hour).
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// No job with the given ID is scheduled.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
