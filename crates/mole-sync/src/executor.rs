use std::sync::Arc;

use chrono::Utc;
use mole_core::{RunRecord, RunStatus, TaskDescriptor};
use mole_store::{RunLedger, TaskRepository};
use mole_vault::CredentialVault;
use tracing::{error, info, instrument, Span};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::postgres::{Secrets, Transfer, TransferSummary};

const POSTGRES: &str = "postgresql";

/// How a scheduled fire ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The task is gone, disabled or set to `never`. Nothing was recorded.
    Stale,
    /// The attempt ran and this record was written.
    Completed(RunRecord),
}

/// Runs one synchronization and records it.
///
/// Every attempt that gets past task resolution writes exactly one
/// [`RunRecord`]; `last_sync` moves only on success.
pub struct SyncExecutor {
    repo: Arc<TaskRepository>,
    ledger: Arc<RunLedger>,
    vault: Arc<CredentialVault>,
    postgres: Arc<dyn Transfer>,
}

impl SyncExecutor {
    pub fn new(
        repo: Arc<TaskRepository>,
        ledger: Arc<RunLedger>,
        vault: Arc<CredentialVault>,
        postgres: Arc<dyn Transfer>,
    ) -> Self {
        Self {
            repo,
            ledger,
            vault,
            postgres,
        }
    }

    /// Scheduled entry point: re-read the task, then run it.
    #[instrument(skip(self))]
    pub async fn run(&self, task_id: i64) -> RunOutcome {
        let repo = Arc::clone(&self.repo);
        let task = match tokio::task::spawn_blocking(move || repo.get_task(task_id)).await {
            Ok(Ok(task)) => task,
            Ok(Err(e)) => {
                info!(error = %e, "task is gone or disabled, skipping fire");
                return RunOutcome::Stale;
            }
            Err(e) => {
                error!(error = %e, "task lookup did not complete, skipping fire");
                return RunOutcome::Stale;
            }
        };
        if task.schedule.is_never() {
            info!("task schedule is never, skipping fire");
            return RunOutcome::Stale;
        }
        RunOutcome::Completed(self.run_descriptor(&task).await)
    }

    /// Run a task as given, without consulting the repository.
    ///
    /// Used directly by the HTTP trigger with a caller-supplied descriptor.
    #[instrument(skip(self, task), fields(task_id = task.task_id, run_id = %Uuid::now_v7()))]
    pub async fn run_descriptor(&self, task: &TaskDescriptor) -> RunRecord {
        let start_time = Utc::now();
        let result = self.execute(task).await;
        let end_time = Utc::now();

        let record = match result {
            Ok(summary) => {
                info!(
                    elapsed_ms = (end_time - start_time).num_milliseconds(),
                    archive = %summary.archive.display(),
                    "sync succeeded"
                );
                RunRecord {
                    task_id: task.task_id,
                    start_time,
                    end_time,
                    status: RunStatus::Success,
                    message: summary.message,
                    rows_synced: summary.rows_synced,
                }
            }
            Err(e) => {
                error!(code = e.code(), error = %e, "sync failed");
                RunRecord {
                    task_id: task.task_id,
                    start_time,
                    end_time,
                    status: RunStatus::Error,
                    message: e.to_string(),
                    rows_synced: 0,
                }
            }
        };

        self.persist(record.clone()).await;
        record
    }

    /// Append the record and, on success, move `last_sync` to its start time.
    async fn persist(&self, record: RunRecord) {
        let ledger = Arc::clone(&self.ledger);
        let span = Span::current();
        let written = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            if let Err(e) = ledger.append(&record) {
                error!(error = %e, "failed to write run record");
            }
            if record.is_success() {
                if let Err(e) = ledger.mark_last_sync(record.task_id, record.start_time) {
                    error!(error = %e, "failed to update last_sync");
                }
            }
        })
        .await;
        if let Err(e) = written {
            error!(error = %e, "ledger write did not complete");
        }
    }

    async fn execute(&self, task: &TaskDescriptor) -> Result<TransferSummary> {
        let secrets = self.decrypt(task)?;
        let transfer = self.transfer_for(task)?;
        transfer.transfer(task, &secrets).await
    }

    fn decrypt(&self, task: &TaskDescriptor) -> Result<Secrets> {
        let source = self
            .vault
            .decrypt(&task.source.encrypted_secret)
            .map_err(|source| SyncError::Decryption {
                side: "source",
                source,
            })?;
        let target = self
            .vault
            .decrypt(&task.target.encrypted_secret)
            .map_err(|source| SyncError::Decryption {
                side: "target",
                source,
            })?;
        Ok(Secrets { source, target })
    }

    fn transfer_for(&self, task: &TaskDescriptor) -> Result<&dyn Transfer> {
        let source_engine = task.source.engine_key();
        let target_engine = task.target.engine_key();
        match (source_engine.as_str(), target_engine.as_str()) {
            (POSTGRES, POSTGRES) => Ok(self.postgres.as_ref()),
            _ => Err(SyncError::UnsupportedPair {
                source_engine,
                target_engine,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use async_trait::async_trait;
    use mole_store::db::init_db;
    use rusqlite::Connection;
    use sha2::{Digest, Sha256};

    use crate::postgres::Phase;

    const PASSPHRASE: &str = "test-passphrase";

    /// What the transfer saw on each call.
    #[derive(Debug, Clone)]
    struct Seen {
        tables: Option<Vec<String>>,
        source_secret: String,
        target_secret: String,
    }

    #[derive(Default)]
    struct FakeTransfer {
        seen: Mutex<Vec<Seen>>,
        fail: bool,
    }

    #[async_trait]
    impl Transfer for FakeTransfer {
        async fn transfer(&self, task: &TaskDescriptor, secrets: &Secrets) -> Result<TransferSummary> {
            self.seen.lock().unwrap().push(Seen {
                tables: task.tables.clone(),
                source_secret: secrets.source.expose().to_string(),
                target_secret: secrets.target.expose().to_string(),
            });
            if self.fail {
                return Err(SyncError::ExternalTool {
                    phase: Phase::Restore,
                    exit_code: 1,
                    stderr: "pg_restore: error: connection refused".to_string(),
                });
            }
            Ok(TransferSummary {
                message: "PostgreSQL sync completed.".to_string(),
                rows_synced: 0,
                archive: PathBuf::from("/tmp/pg_dump_task_7.dump"),
            })
        }
    }

    fn encrypt(plaintext: &str) -> String {
        let digest = hex::encode(Sha256::digest(PASSPHRASE.as_bytes()));
        let key = &digest.as_bytes()[..32];
        let iv = [7u8; 16];
        let payload = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}:{}", hex::encode(iv), hex::encode(payload))
    }

    struct Fixture {
        db: Arc<Mutex<Connection>>,
        ledger: Arc<RunLedger>,
        transfer: Arc<FakeTransfer>,
        executor: SyncExecutor,
    }

    fn fixture(fail: bool) -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO database_connections (id, name, engine, host, port, database, username, encrypted_password)
             VALUES (1, 'pgA', 'PostgreSQL', 'a.local', 5432, 'metrics', 'reader', ?1),
                    (2, 'pgB', 'postgresql', 'b.local', 5432, 'metrics', 'writer', ?2),
                    (3, 'my', 'mysql', 'c.local', 3306, 'shop', 'root', 'plain-legacy')",
            rusqlite::params![encrypt("src-secret"), encrypt("tgt-secret")],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO sync_tasks (id, name, schedule, enabled, source_connection_id, target_connection_id)
             VALUES (7, 'seven', 'hourly', 1, 1, 2),
                    (8, 'eight', 'never', 1, 1, 2),
                    (9, 'nine', 'daily', 0, 1, 2),
                    (10, 'ten', 'daily', 1, 3, 2);",
        )
        .unwrap();

        let db = Arc::new(Mutex::new(conn));
        let ledger = Arc::new(RunLedger::new(Arc::clone(&db)));
        let transfer = Arc::new(FakeTransfer {
            fail,
            ..Default::default()
        });
        let executor = SyncExecutor::new(
            Arc::new(TaskRepository::new(Arc::clone(&db))),
            Arc::clone(&ledger),
            Arc::new(CredentialVault::new(PASSPHRASE)),
            transfer.clone(),
        );
        Fixture {
            db,
            ledger,
            transfer,
            executor,
        }
    }

    fn log_count(f: &Fixture) -> i64 {
        f.db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM sync_logs", [], |r| r.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn stale_fires_write_nothing() {
        let f = fixture(false);
        assert_eq!(f.executor.run(404).await, RunOutcome::Stale);
        assert_eq!(f.executor.run(8).await, RunOutcome::Stale);
        assert_eq!(f.executor.run(9).await, RunOutcome::Stale);
        assert_eq!(log_count(&f), 0);
        assert!(f.transfer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_records_once_and_stamps_last_sync() {
        let f = fixture(false);
        let RunOutcome::Completed(record) = f.executor.run(7).await else {
            panic!("expected a completed run");
        };
        assert!(record.is_success());
        assert_eq!(record.message, "PostgreSQL sync completed.");
        assert_eq!(log_count(&f), 1);

        let last = f.ledger.last_sync(7).unwrap().unwrap();
        assert_eq!(last.timestamp(), record.start_time.timestamp());

        let seen = f.transfer.seen.lock().unwrap();
        assert_eq!(seen[0].source_secret, "src-secret");
        assert_eq!(seen[0].target_secret, "tgt-secret");
    }

    #[tokio::test]
    async fn locked_store_does_not_stall_the_runtime() {
        let f = fixture(false);
        let held = f.db.lock().unwrap();
        let run = f.executor.run(7);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run finished while the store was locked"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        drop(held);

        assert!(matches!(run.await, RunOutcome::Completed(r) if r.is_success()));
        assert_eq!(log_count(&f), 1);
    }

    #[tokio::test]
    async fn transfer_failure_records_error_and_keeps_last_sync() {
        let f = fixture(true);
        let RunOutcome::Completed(record) = f.executor.run(7).await else {
            panic!("expected a completed run");
        };
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(
            record.message,
            "restore failed (exit 1): pg_restore: error: connection refused"
        );
        assert_eq!(log_count(&f), 1);
        assert_eq!(f.ledger.last_sync(7).unwrap(), None);
    }

    #[tokio::test]
    async fn undecryptable_secret_aborts_before_transfer() {
        let f = fixture(false);
        f.db.lock()
            .unwrap()
            .execute(
                "UPDATE database_connections SET encrypted_password = ?1 WHERE id = 2",
                ["deadbeefdeadbeefdeadbeefdeadbeef:00"],
            )
            .unwrap();

        let RunOutcome::Completed(record) = f.executor.run(7).await else {
            panic!("expected a completed run");
        };
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.message.starts_with("decrypt target password failed"));
        assert!(f.transfer.seen.lock().unwrap().is_empty());
        assert_eq!(log_count(&f), 1);
        assert_eq!(f.ledger.last_sync(7).unwrap(), None);
    }

    #[tokio::test]
    async fn unsupported_pair_is_recorded() {
        let f = fixture(false);
        let RunOutcome::Completed(record) = f.executor.run(10).await else {
            panic!("expected a completed run");
        };
        assert_eq!(record.message, "unsupported pair: mysql to postgresql");
        assert!(f.transfer.seen.lock().unwrap().is_empty());
        assert_eq!(log_count(&f), 1);
    }

    #[tokio::test]
    async fn each_fire_sees_current_task_fields() {
        let f = fixture(false);
        f.executor.run(7).await;
        f.db.lock()
            .unwrap()
            .execute(r#"UPDATE sync_tasks SET tables = '["orders"]' WHERE id = 7"#, [])
            .unwrap();
        f.executor.run(7).await;

        let seen = f.transfer.seen.lock().unwrap();
        assert_eq!(seen[0].tables, None);
        assert_eq!(seen[1].tables, Some(vec!["orders".to_string()]));
    }

    #[tokio::test]
    async fn ad_hoc_descriptor_bypasses_repository() {
        let f = fixture(false);
        let mut task = f.executor.repo.get_task(7).unwrap();
        task.task_id = 4242;
        task.source.encrypted_secret = "legacy-plain".to_string();

        let record = f.executor.run_descriptor(&task).await;
        assert!(record.is_success());
        assert_eq!(record.task_id, 4242);
        assert_eq!(f.transfer.seen.lock().unwrap()[0].source_secret, "legacy-plain");
        assert_eq!(f.ledger.recent_runs(4242, 5).unwrap().len(), 1);
    }
}
