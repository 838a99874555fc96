//! Job actions: the tagged payload a scheduler job carries instead of a
//! captured closure.

use serde::{Deserialize, Serialize};

/// What a fired job asks the dispatcher to do.
///
/// A `Sync` action carries only the task id; the dispatcher re-reads the task
/// from the control store at fire time so edits and credential rotation are
/// always picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobAction {
    /// Run one synchronization for the task.
    Sync { task_id: i64 },
    /// Reconcile the live job set against the task table.
    Reconcile,
}
