//! Postgres → Postgres transfer.
//!
//! The target database is rebuilt from scratch on every run:
//!
//! | Step | Phases                                           | Runs as            |
//! |------|--------------------------------------------------|--------------------|
//! | a    | `drop database` (non-fatal), `create database`   | admin on `postgres`|
//! | b    | `create extension`, `pre-restore`                | target user, admin |
//! | c    | `dump` (designated table data excluded)          | source user        |
//! | d    | `restore`                                        | target user        |
//! | e    | `drop trigger` (non-fatal)                       | target user        |
//! | f    | `create hypertable`                              | target user        |
//! | g    | `restoring off`, `export`, `import`, `restoring on` | admin / source / target |
//! | h    | `post-restore`                                   | admin on target db |
//!
//! `restoring on` always runs once `restoring off` succeeded, and the CSV is
//! always removed. The dump archive is never removed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mole_core::config::PostgresConfig;
use mole_core::{ConnectionDescriptor, TaskDescriptor};
use mole_vault::PlainSecret;
use tracing::{info, warn};

use crate::command::{CommandRunner, CommandSpec, ExecResult};
use crate::error::{Result, SyncError};
use crate::truncate::{truncate_output, MAX_MESSAGE_CHARS};

/// Database used for drop/create, which cannot run against the target itself.
const MAINTENANCE_DB: &str = "postgres";
const INGEST_BLOCKER_TRIGGER: &str = "ts_insert_blocker";
pub const COMPLETED_MESSAGE: &str = "PostgreSQL sync completed.";

/// One external tool step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DropDatabase,
    CreateDatabase,
    CreateExtension,
    PreRestore,
    Dump,
    Restore,
    DropTrigger,
    CreateHypertable,
    RestoringOff,
    Export,
    Import,
    RestoringOn,
    PostRestore,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::DropDatabase => "drop database",
            Phase::CreateDatabase => "create database",
            Phase::CreateExtension => "create extension",
            Phase::PreRestore => "pre-restore",
            Phase::Dump => "dump",
            Phase::Restore => "restore",
            Phase::DropTrigger => "drop trigger",
            Phase::CreateHypertable => "create hypertable",
            Phase::RestoringOff => "restoring off",
            Phase::Export => "export",
            Phase::Import => "import",
            Phase::RestoringOn => "restoring on",
            Phase::PostRestore => "post-restore",
        };
        f.write_str(s)
    }
}

/// Decrypted passwords for one run.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub source: PlainSecret,
    pub target: PlainSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub message: String,
    /// Not counted for Postgres pairs; always 0.
    pub rows_synced: u64,
    /// Dump archive left on disk.
    pub archive: PathBuf,
}

/// Moves data for one engine pair.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(&self, task: &TaskDescriptor, secrets: &Secrets) -> Result<TransferSummary>;
}

/// Connection parameters for one tool invocation.
#[derive(Clone, Copy)]
struct Endpoint<'a> {
    host: &'a str,
    port: u16,
    user: &'a str,
    password: &'a str,
    database: &'a str,
    ssl: bool,
}

impl<'a> Endpoint<'a> {
    fn of(conn: &'a ConnectionDescriptor, password: &'a PlainSecret) -> Self {
        Self {
            host: &conn.host,
            port: conn.port,
            user: &conn.username,
            password: password.expose(),
            database: &conn.database,
            ssl: conn.ssl_enabled,
        }
    }

    fn command(&self, phase: Phase, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(phase, program)
            .args(["--host", self.host])
            .arg("--port")
            .arg(self.port.to_string())
            .args(["--username", self.user, "--dbname", self.database])
            .env("PGPASSWORD", self.password);
        if self.ssl {
            spec.env("PGSSLMODE", "require")
        } else {
            spec
        }
    }

    fn psql(&self, phase: Phase, sql: impl Into<String>) -> CommandSpec {
        self.command(phase, "psql").arg("-qtAX").arg("-c").arg(sql)
    }
}

/// Archive and CSV locations for one run.
#[derive(Debug, Clone)]
struct WorkPaths {
    archive: PathBuf,
    csv: PathBuf,
}

impl WorkPaths {
    fn new(work_dir: &Path, task_id: i64, table: &str, at: DateTime<Utc>) -> Self {
        let short = table.rsplit('.').next().unwrap_or(table);
        Self {
            archive: work_dir.join(format!(
                "pg_dump_task_{task_id}_{}.dump",
                at.format("%Y%m%d%H%M%S")
            )),
            csv: work_dir.join(format!("{short}_data_task_{task_id}.csv")),
        }
    }
}

/// Rebuilds the target database from the source with `psql`, `pg_dump` and
/// `pg_restore`.
pub struct PostgresTransfer {
    runner: Arc<dyn CommandRunner>,
    config: PostgresConfig,
}

impl PostgresTransfer {
    pub fn new(runner: Arc<dyn CommandRunner>, config: PostgresConfig) -> Self {
        Self { runner, config }
    }

    async fn pipeline(
        &self,
        task: &TaskDescriptor,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        paths: &WorkPaths,
    ) -> Result<()> {
        let admin = Endpoint {
            user: &self.config.admin_user,
            password: &self.config.admin_password,
            database: MAINTENANCE_DB,
            ..target
        };
        let admin_target = Endpoint {
            database: target.database,
            ..admin
        };
        let table = self.config.designated_table.as_str();
        let db = quote_ident(target.database);

        // a. fresh target database
        self.run_lenient(admin.psql(
            Phase::DropDatabase,
            format!("DROP DATABASE IF EXISTS {db} WITH (FORCE);"),
        ))
        .await;
        self.run_checked(admin.psql(
            Phase::CreateDatabase,
            format!("CREATE DATABASE {db} OWNER {};", quote_ident(target.user)),
        ))
        .await?;

        // b. extension and pre-restore hook
        self.run_checked(target.psql(
            Phase::CreateExtension,
            format!(
                "CREATE EXTENSION IF NOT EXISTS {} SCHEMA public;",
                self.config.extension
            ),
        ))
        .await?;
        self.run_checked(admin_target.psql(
            Phase::PreRestore,
            "SELECT timescaledb_pre_restore();SET client_min_messages TO WARNING;",
        ))
        .await?;

        // c. dump
        let mut dump = source
            .command(Phase::Dump, "pg_dump")
            .arg("--format=custom")
            .arg("--file")
            .arg(paths.archive.to_string_lossy())
            .args(["--no-owner", "--no-acl", "--no-comments"]);
        for schema in &self.config.excluded_schemas {
            dump = dump.arg(format!("--exclude-schema={schema}"));
        }
        dump = dump.arg(format!("--exclude-table-data={table}"));
        self.run_checked(dump).await?;
        info!(task_id = task.task_id, archive = %paths.archive.display(), "source dumped");

        // d. restore
        self.run_checked(
            target
                .command(Phase::Restore, "pg_restore")
                .args(["--no-owner", "-v"])
                .arg(paths.archive.to_string_lossy()),
        )
        .await?;

        // e. f. designated table
        self.run_lenient(target.psql(
            Phase::DropTrigger,
            format!("DROP TRIGGER IF EXISTS {INGEST_BLOCKER_TRIGGER} ON {table};"),
        ))
        .await;
        self.run_checked(target.psql(
            Phase::CreateHypertable,
            format!(
                "SELECT create_hypertable({}, {}, if_not_exists => TRUE, migrate_data => FALSE);",
                quote_literal(table),
                quote_literal(&self.config.time_column)
            ),
        ))
        .await?;

        // g. bulk copy with the restoring flag lowered
        self.run_checked(admin_target.psql(
            Phase::RestoringOff,
            format!("ALTER DATABASE {db} SET timescaledb.restoring = 'off';"),
        ))
        .await?;
        let copied = self.copy_table(task, source, target, &paths.csv).await;
        let raised = self
            .run_checked(admin_target.psql(
                Phase::RestoringOn,
                format!("ALTER DATABASE {db} SET timescaledb.restoring = 'on';"),
            ))
            .await;
        remove_csv(&paths.csv).await;
        copied?;
        raised?;

        // h. post-restore hook
        self.run_checked(admin_target.psql(
            Phase::PostRestore,
            "SELECT timescaledb_post_restore();",
        ))
        .await?;
        Ok(())
    }

    /// Export the designated table from the source to `csv` and import it.
    async fn copy_table(
        &self,
        task: &TaskDescriptor,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        csv: &Path,
    ) -> Result<()> {
        let table = self.config.designated_table.as_str();
        let file = quote_literal(&csv.to_string_lossy());

        self.run_checked(source.psql(
            Phase::Export,
            format!("\\COPY (SELECT * FROM {table}) TO {file} WITH CSV HEADER"),
        ))
        .await?;

        if !tokio::fs::try_exists(csv).await.unwrap_or(false) {
            warn!(task_id = task.task_id, csv = %csv.display(), "export produced no file, skipping import");
            return Ok(());
        }
        self.run_checked(target.psql(
            Phase::Import,
            format!("\\COPY {table} FROM {file} WITH CSV HEADER"),
        ))
        .await?;
        info!(task_id = task.task_id, %table, "designated table copied");
        Ok(())
    }

    /// Run a phase whose non-zero exit aborts the pipeline.
    async fn run_checked(&self, spec: CommandSpec) -> Result<ExecResult> {
        let result = self.runner.run(&spec).await?;
        if !result.success() {
            warn!(phase = %spec.phase, exit_code = result.exit_code, "phase failed");
            return Err(SyncError::ExternalTool {
                phase: spec.phase,
                exit_code: result.exit_code,
                stderr: truncate_output(result.stderr.trim(), MAX_MESSAGE_CHARS),
            });
        }
        Ok(result)
    }

    /// Run a phase whose failure is only logged.
    async fn run_lenient(&self, spec: CommandSpec) {
        match self.runner.run(&spec).await {
            Ok(result) if result.success() => {}
            Ok(result) => warn!(
                phase = %spec.phase,
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "non-fatal phase failed, continuing"
            ),
            Err(e) => warn!(phase = %spec.phase, error = %e, "non-fatal phase failed, continuing"),
        }
    }
}

#[async_trait]
impl Transfer for PostgresTransfer {
    async fn transfer(&self, task: &TaskDescriptor, secrets: &Secrets) -> Result<TransferSummary> {
        let paths = WorkPaths::new(
            Path::new(&self.config.work_dir),
            task.task_id,
            &self.config.designated_table,
            Utc::now(),
        );
        let source = Endpoint::of(&task.source, &secrets.source);
        let target = Endpoint::of(&task.target, &secrets.target);

        info!(
            task_id = task.task_id,
            source = %format!("{}:{}/{}", source.host, source.port, source.database),
            target = %format!("{}:{}/{}", target.host, target.port, target.database),
            "postgres transfer started"
        );
        let result = self.pipeline(task, source, target, &paths).await;

        if tokio::fs::try_exists(&paths.archive).await.unwrap_or(false) {
            info!(task_id = task.task_id, archive = %paths.archive.display(), "dump archive kept");
        }

        result.map(|()| TransferSummary {
            message: COMPLETED_MESSAGE.to_string(),
            rows_synced: 0,
            archive: paths.archive,
        })
    }
}

async fn remove_csv(csv: &Path) {
    match tokio::fs::remove_file(csv).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(csv = %csv.display(), error = %e, "failed to remove CSV export"),
    }
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
