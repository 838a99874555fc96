//! Shared fixtures for handler and dispatcher tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mole_core::config::MoleConfig;
use mole_core::TaskDescriptor;
use mole_scheduler::{FiredJob, Reconciler, Scheduler};
use mole_store::{RunLedger, TaskRepository};
use mole_sync::{Secrets, SyncExecutor, Transfer, TransferSummary};
use mole_vault::CredentialVault;
use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::app::AppState;

#[derive(Debug, Clone)]
pub struct Seen {
    pub task_id: i64,
    pub tables: Option<Vec<String>>,
}

/// Succeeds without touching any database.
#[derive(Default)]
pub struct FakeTransfer {
    pub seen: Mutex<Vec<Seen>>,
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn transfer(
        &self,
        task: &TaskDescriptor,
        _secrets: &Secrets,
    ) -> mole_sync::Result<TransferSummary> {
        self.seen.lock().unwrap().push(Seen {
            task_id: task.task_id,
            tables: task.tables.clone(),
        });
        Ok(TransferSummary {
            message: "PostgreSQL sync completed.".to_string(),
            rows_synced: 0,
            archive: PathBuf::from("/tmp/test.dump"),
        })
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub reconciler: Arc<Reconciler>,
    pub transfer: Arc<FakeTransfer>,
    pub fired_rx: mpsc::Receiver<FiredJob>,
    db: Arc<Mutex<Connection>>,
}

pub fn harness() -> Harness {
    let conn = Connection::open_in_memory().unwrap();
    mole_store::db::init_db(&conn).unwrap();
    conn.execute_batch(
        "INSERT INTO database_connections (id, name, engine, host, port, database, username, encrypted_password)
         VALUES (1, 'pgA', 'postgresql', 'a.local', 5432, 'metrics', 'reader', 'plain-a'),
                (2, 'pgB', 'postgresql', 'b.local', 5432, 'metrics', 'writer', 'plain-b');",
    )
    .unwrap();
    let db = Arc::new(Mutex::new(conn));

    let repo = Arc::new(TaskRepository::new(Arc::clone(&db)));
    let transfer = Arc::new(FakeTransfer::default());
    let executor = Arc::new(SyncExecutor::new(
        Arc::clone(&repo),
        Arc::new(RunLedger::new(Arc::clone(&db))),
        Arc::new(CredentialVault::new("test")),
        transfer.clone(),
    ));

    let (fired_tx, fired_rx) = mpsc::channel(16);
    let scheduler = Arc::new(Scheduler::new(fired_tx, Duration::from_millis(10)));
    let reconciler = Arc::new(Reconciler::new(repo, Arc::clone(&scheduler)));
    let state = Arc::new(AppState::new(MoleConfig::default(), scheduler, executor));

    Harness {
        state,
        reconciler,
        transfer,
        fired_rx,
        db,
    }
}

impl Harness {
    pub fn insert_task(&self, task_id: i64, schedule: &str) {
        self.db
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO sync_tasks (id, name, schedule, source_connection_id, target_connection_id)
                 VALUES (?1, ?2, ?3, 1, 2)",
                rusqlite::params![task_id, format!("task {task_id}"), schedule],
            )
            .unwrap();
    }

    pub fn record_count(&self, task_id: i64) -> i64 {
        self.db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sync_logs WHERE task_id = ?1",
                [task_id],
                |r| r.get(0),
            )
            .unwrap()
    }

    /// Wait for a background run holding `job_id`'s slot to finish.
    pub async fn wait_until_idle(&self, job_id: &str) {
        for _ in 0..200 {
            if !self.state.scheduler.is_running(job_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{job_id} still running");
    }
}
