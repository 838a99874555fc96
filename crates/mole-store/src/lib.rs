//! `mole-store`: access to the control store shared with the admin backend.
//!
//! The control store is a SQLite file owned by the admin backend. This crate
//! only reads `sync_tasks` / `database_connections` (see [`TaskRepository`])
//! and appends to `sync_logs` plus bumps `sync_tasks.last_sync`
//! (see [`RunLedger`]).

pub mod db;
pub mod error;
pub mod ledger;
pub mod repository;

pub use error::{Result, StoreError};
pub use ledger::RunLedger;
pub use repository::TaskRepository;
