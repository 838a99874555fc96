use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace prefix of every scheduler job that belongs to a sync task.
pub const JOB_ID_PREFIX: &str = "dbtask_";

/// Scheduler job id for a task: `dbtask_<task_id>`.
pub fn job_id_for(task_id: i64) -> String {
    format!("{JOB_ID_PREFIX}{task_id}")
}

/// Inverse of [`job_id_for`]. Returns `None` for ids outside the task namespace.
pub fn task_id_from_job_id(job_id: &str) -> Option<i64> {
    job_id.strip_prefix(JOB_ID_PREFIX)?.parse().ok()
}

/// How often a task should run, as stored in `sync_tasks.schedule`.
///
/// Parsing is case-insensitive and never fails: strings outside the known set
/// are kept as [`ScheduleFrequency::Unsupported`] so the scheduler can log and
/// skip them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScheduleFrequency {
    Hourly,
    Daily,
    Weekly,
    Never,
    Unsupported(String),
}

impl ScheduleFrequency {
    pub fn is_never(&self) -> bool {
        matches!(self, ScheduleFrequency::Never)
    }
}

impl From<&str> for ScheduleFrequency {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => ScheduleFrequency::Hourly,
            "daily" => ScheduleFrequency::Daily,
            "weekly" => ScheduleFrequency::Weekly,
            "never" => ScheduleFrequency::Never,
            other => ScheduleFrequency::Unsupported(other.to_string()),
        }
    }
}

impl From<String> for ScheduleFrequency {
    fn from(s: String) -> Self {
        ScheduleFrequency::from(s.as_str())
    }
}

impl From<ScheduleFrequency> for String {
    fn from(f: ScheduleFrequency) -> Self {
        f.to_string()
    }
}

impl fmt::Display for ScheduleFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleFrequency::Hourly => "hourly",
            ScheduleFrequency::Daily => "daily",
            ScheduleFrequency::Weekly => "weekly",
            ScheduleFrequency::Never => "never",
            ScheduleFrequency::Unsupported(other) => other.as_str(),
        };
        write!(f, "{s}")
    }
}

/// Connection details for one database, as stored in `database_connections`.
///
/// `encrypted_secret` is the at-rest ciphertext; it is decrypted per run by
/// the credential vault and never written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: i64,
    pub name: String,
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub encrypted_secret: String,
    pub ssl_enabled: bool,
}

impl ConnectionDescriptor {
    /// Lower-cased engine name used for pair dispatch.
    pub fn engine_key(&self) -> String {
        self.engine.trim().to_ascii_lowercase()
    }
}

/// One configured source → target synchronization.
///
/// Always re-read from the control store; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: i64,
    pub name: String,
    pub schedule: ScheduleFrequency,
    /// `None` means every table.
    pub tables: Option<Vec<String>>,
    pub source: ConnectionDescriptor,
    pub target: ConnectionDescriptor,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Immutable audit row for one execution attempt (`sync_logs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    pub rows_synced: u64,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
