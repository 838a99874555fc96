use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use mole_core::{RunRecord, RunStatus};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, instrument, warn};

use crate::error::Result;

/// Append-only run log (`sync_logs`) plus the per-task last-success stamp.
pub struct RunLedger {
    db: Arc<Mutex<Connection>>,
}

impl RunLedger {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Append one run record. Returns the new row id.
    #[instrument(skip(self, record), fields(task_id = record.task_id, status = %record.status))]
    pub fn append(&self, record: &RunRecord) -> Result<i64> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.execute(
            "INSERT INTO sync_logs (task_id, start_time, end_time, status, message, rows_synced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.task_id,
                record.start_time.to_rfc3339(),
                record.end_time.to_rfc3339(),
                record.status.to_string(),
                record.message,
                record.rows_synced as i64,
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(log_id = id, "run recorded");
        Ok(id)
    }

    /// Stamp `last_sync` for a task after a successful run.
    #[instrument(skip(self))]
    pub fn mark_last_sync(&self, task_id: i64, at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let n = db.execute(
            "UPDATE sync_tasks SET last_sync = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![at.to_rfc3339(), now, task_id],
        )?;
        if n == 0 {
            // Ad hoc runs may carry ids unknown to the control store.
            warn!(task_id, "last_sync not updated: no such task");
        } else {
            info!(task_id, "last_sync updated");
        }
        Ok(())
    }

    /// Last successful sync time for a task, if any.
    pub fn last_sync(&self, task_id: i64) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let raw: Option<Option<String>> = db
            .query_row(
                "SELECT last_sync FROM sync_tasks WHERE id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.flatten().and_then(|s| parse_time(&s)))
    }

    /// Most recent run records for a task, newest first.
    pub fn recent_runs(&self, task_id: i64, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare(
            "SELECT task_id, start_time, end_time, status, message, rows_synced
             FROM sync_logs
             WHERE task_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let records = stmt
            .query_map(rusqlite::params![task_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,            // task_id
                    row.get::<_, String>(1)?,         // start_time
                    row.get::<_, String>(2)?,         // end_time
                    row.get::<_, String>(3)?,         // status
                    row.get::<_, Option<String>>(4)?, // message
                    row.get::<_, i64>(5)?,            // rows_synced
                ))
            })?
            .filter_map(|r| {
                let (task_id, start, end, status, message, rows) = r.ok()?;
                Some(RunRecord {
                    task_id,
                    start_time: parse_time(&start)?,
                    end_time: parse_time(&end)?,
                    status: status.parse::<RunStatus>().ok()?,
                    message: message.unwrap_or_default(),
                    rows_synced: rows.max(0) as u64,
                })
            })
            .collect();
        Ok(records)
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
