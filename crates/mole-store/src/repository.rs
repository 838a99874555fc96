use std::sync::{Arc, Mutex, PoisonError};

use mole_core::{ConnectionDescriptor, ScheduleFrequency, TaskDescriptor};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, StoreError};

/// Task ⨝ source connection ⨝ target connection. Column order is relied on
/// by [`RawTaskRow::from_row`].
const TASK_SELECT: &str = "
    SELECT st.id, st.name, st.schedule, st.tables,
           s.id, s.name, s.engine, s.host, s.port, s.database,
           s.username, s.encrypted_password, s.ssl_enabled,
           t.id, t.name, t.engine, t.host, t.port, t.database,
           t.username, t.encrypted_password, t.ssl_enabled
    FROM sync_tasks st
    JOIN database_connections s ON st.source_connection_id = s.id
    JOIN database_connections t ON st.target_connection_id = t.id";

/// Read-only projection of `sync_tasks` into [`TaskDescriptor`]s.
///
/// Never surfaces store failures to callers: listing degrades to an empty
/// set and single lookups degrade to `TaskNotFound`, so a flaky control store
/// cannot take down the scheduler or a worker task.
pub struct TaskRepository {
    db: Arc<Mutex<Connection>>,
}

impl TaskRepository {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Every enabled task whose schedule is set and is not `never`, by id.
    ///
    /// Rows that cannot be interpreted are logged and skipped. If the store
    /// itself cannot be read the result is empty.
    #[instrument(skip(self))]
    pub fn list_scheduled_tasks(&self) -> Vec<TaskDescriptor> {
        let rows = match self.query_scheduled() {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "control store unavailable, treating as zero tasks");
                return Vec::new();
            }
        };

        let tasks: Vec<TaskDescriptor> = rows
            .into_iter()
            .filter_map(|row| match row {
                Ok((task_id, Err(e))) => {
                    warn!(task_id, error = %e, "skipping task with unreadable columns");
                    None
                }
                Ok((_, Ok(raw))) => match raw.into_descriptor() {
                    Ok(task) => Some(task),
                    Err(e) => {
                        warn!(error = %e, "skipping task with invalid configuration");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "skipping unreadable task row");
                    None
                }
            })
            .collect();

        info!(count = tasks.len(), "fetched scheduled tasks");
        tasks
    }

    /// The enabled task with `task_id`, regardless of schedule.
    ///
    /// Any failure (missing row, disabled task, unreadable store, bad data)
    /// is logged and reported as [`StoreError::TaskNotFound`].
    #[instrument(skip(self))]
    pub fn get_task(&self, task_id: i64) -> Result<TaskDescriptor> {
        match self.query_one(task_id) {
            Ok(Some(raw)) => raw.into_descriptor().map_err(|e| {
                warn!(task_id, error = %e, "task row is invalid");
                StoreError::TaskNotFound { task_id }
            }),
            Ok(None) => {
                debug!(task_id, "task not found or disabled");
                Err(StoreError::TaskNotFound { task_id })
            }
            Err(e) => {
                error!(task_id, error = %e, "failed to read task");
                Err(StoreError::TaskNotFound { task_id })
            }
        }
    }

    /// One entry per row. Column type errors stay attached to their row so a
    /// single bad connection cannot hide every other task.
    fn query_scheduled(&self) -> Result<Vec<ScheduledRow>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare(&format!(
            "{TASK_SELECT}
             WHERE st.enabled = 1 AND st.schedule IS NOT NULL AND lower(st.schedule) != 'never'
             ORDER BY st.id"
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, RawTaskRow::from_row(row))))?
            .collect();
        Ok(rows)
    }

    fn query_one(&self, task_id: i64) -> Result<Option<RawTaskRow>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let row = db
            .query_row(
                &format!("{TASK_SELECT} WHERE st.id = ?1 AND st.enabled = 1"),
                [task_id],
                RawTaskRow::from_row,
            )
            .optional()?;
        Ok(row)
    }
}

/// A listed row: the task id, then the rest of its columns if they decoded.
type ScheduledRow = rusqlite::Result<(i64, rusqlite::Result<RawTaskRow>)>;

/// Untyped columns of one joined task row, before validation.
struct RawTaskRow {
    task_id: i64,
    name: String,
    schedule: Option<String>,
    tables: Option<String>,
    source: RawConnection,
    target: RawConnection,
}

struct RawConnection {
    id: i64,
    name: String,
    engine: String,
    host: String,
    port: i64,
    database: String,
    username: String,
    encrypted_password: Option<String>,
    ssl_enabled: Option<i64>,
}

impl RawTaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            name: row.get(1)?,
            schedule: row.get(2)?,
            tables: row.get(3)?,
            source: RawConnection::from_row(row, 4)?,
            target: RawConnection::from_row(row, 13)?,
        })
    }

    fn into_descriptor(self) -> Result<TaskDescriptor> {
        let task_id = self.task_id;
        let invalid = |reason: String| StoreError::InvalidTask { task_id, reason };

        Ok(TaskDescriptor {
            task_id,
            name: self.name,
            schedule: self
                .schedule
                .as_deref()
                .map(ScheduleFrequency::from)
                .unwrap_or(ScheduleFrequency::Never),
            tables: parse_tables(self.tables.as_deref()).map_err(invalid)?,
            source: self.source.into_descriptor().map_err(|r| invalid(format!("source: {r}")))?,
            target: self.target.into_descriptor().map_err(|r| invalid(format!("target: {r}")))?,
        })
    }
}

impl RawConnection {
    fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            name: row.get(offset + 1)?,
            engine: row.get(offset + 2)?,
            host: row.get(offset + 3)?,
            port: row.get(offset + 4)?,
            database: row.get(offset + 5)?,
            username: row.get(offset + 6)?,
            encrypted_password: row.get(offset + 7)?,
            ssl_enabled: row.get(offset + 8)?,
        })
    }

    fn into_descriptor(self) -> std::result::Result<ConnectionDescriptor, String> {
        let port = u16::try_from(self.port)
            .map_err(|_| format!("port {} out of range", self.port))?;
        Ok(ConnectionDescriptor {
            id: self.id,
            name: self.name,
            engine: self.engine,
            host: self.host,
            port,
            database: self.database,
            username: self.username,
            encrypted_secret: self.encrypted_password.unwrap_or_default(),
            ssl_enabled: self.ssl_enabled.unwrap_or(0) != 0,
        })
    }
}

/// `sync_tasks.tables`: NULL, empty, `"all"` or a JSON array of names.
fn parse_tables(raw: Option<&str>) -> std::result::Result<Option<Vec<String>>, String> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(s) if s.eq_ignore_ascii_case("all") => return Ok(None),
        Some(s) => s,
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Null) => Ok(None),
        Ok(Value::String(s)) if s.eq_ignore_ascii_case("all") => Ok(None),
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(format!("table name must be a string, got {other}")),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Some),
        Ok(other) => Err(format!("tables must be a JSON array, got {other}")),
        Err(e) => Err(format!("tables is not valid JSON: {e}")),
    }
}
