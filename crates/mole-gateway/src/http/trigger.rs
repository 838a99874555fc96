//! On-demand sync endpoint: POST /trigger_sync.
//!
//! The caller supplies the full task descriptor (connections included, with
//! passwords still encrypted); the repository is not consulted. The run
//! shares the scheduled job's single-flight slot, so an ad hoc run and a
//! scheduled fire of the same task never overlap.

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use mole_core::{job_id_for, ConnectionDescriptor, ScheduleFrequency, TaskDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type HandlerError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    task_id: Option<i64>,
    source: Option<ConnectionPayload>,
    target: Option<ConnectionPayload>,
    #[serde(default)]
    tables: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionPayload {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    engine: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    /// Ciphertext or legacy plaintext, exactly as stored.
    #[serde(default)]
    password: Option<String>,
    /// `true`/`false` or the control store's `0`/`1`.
    #[serde(default)]
    ssl_enabled: Value,
}

impl ConnectionPayload {
    fn into_descriptor(self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: self.id,
            name: self.name,
            engine: self.engine,
            host: self.host,
            port: self.port,
            database: self.database,
            username: self.username,
            encrypted_secret: self.password.unwrap_or_default(),
            ssl_enabled: match self.ssl_enabled {
                Value::Bool(b) => b,
                Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
                _ => false,
            },
        }
    }
}

/// POST /trigger_sync
///
/// Returns 202 once the run is started in the background, 400 on a bad
/// body, 409 if the task is already running and 500 if the service is
/// shutting down.
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    let task = parse_request(&body)?;
    let task_id = task.task_id;
    info!(task_id, "received sync trigger request");

    if state.scheduler.is_stopped() {
        return Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to start sync: service is shutting down",
        ));
    }

    let Some(guard) = state.scheduler.try_acquire(&job_id_for(task_id)) else {
        warn!(task_id, "trigger rejected, task already running");
        return Err(error(
            StatusCode::CONFLICT,
            &format!("Sync task {task_id} is already running."),
        ));
    };

    let executor = Arc::clone(&state.executor);
    tokio::spawn(async move {
        let _guard = guard;
        let record = executor.run_descriptor(&task).await;
        info!(task_id, status = %record.status, "ad hoc sync finished");
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message": format!("Sync task {task_id} started.")})),
    ))
}

fn parse_request(body: &[u8]) -> Result<TaskDescriptor, HandlerError> {
    let request: TriggerRequest = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "invalid trigger body");
        error(StatusCode::BAD_REQUEST, &format!("Request must be JSON: {e}"))
    })?;

    let (Some(task_id), Some(source), Some(target)) =
        (request.task_id.filter(|id| *id != 0), request.source, request.target)
    else {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "Missing taskId, source, or target",
        ));
    };

    Ok(TaskDescriptor {
        task_id,
        name: format!("Task {task_id}"),
        // Not consulted for ad hoc runs.
        schedule: ScheduleFrequency::Never,
        tables: tables_from(&request.tables),
        source: source.into_descriptor(),
        target: target.into_descriptor(),
    })
}

/// `null`, `"all"` and anything unrecognised mean every table.
fn tables_from(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let tables: Vec<String> = items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    (!tables.is_empty()).then_some(tables)
}

fn error(status: StatusCode, message: &str) -> HandlerError {
    (status, Json(json!({ "error": message })))
}
