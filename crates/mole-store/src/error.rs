use thiserror::Error;

/// Errors that can occur while reading or writing the control store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No enabled task with this id exists (or it could not be read).
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: i64 },

    /// A task or connection row holds data that cannot be interpreted.
    #[error("invalid configuration for task {task_id}: {reason}")]
    InvalidTask { task_id: i64, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
