//! `mole-sync`: runs one synchronization for a task.
//!
//! [`SyncExecutor`] re-resolves the task, decrypts both passwords, picks a
//! [`Transfer`] for the engine pair and records exactly one run in the
//! ledger. The Postgres → Postgres pipeline ([`PostgresTransfer`]) drives
//! `psql`, `pg_dump` and `pg_restore` through a [`CommandRunner`], so tests
//! can swap in a fake.

pub mod command;
pub mod error;
pub mod executor;
pub mod postgres;
pub mod truncate;

pub use command::{CommandRunner, CommandSpec, ExecResult, ProcessRunner};
pub use error::{Result, SyncError};
pub use executor::{RunOutcome, SyncExecutor};
pub use postgres::{Phase, PostgresTransfer, Secrets, Transfer, TransferSummary};
