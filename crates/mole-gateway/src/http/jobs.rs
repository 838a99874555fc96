use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /jobs: live scheduler jobs with their next fire time.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs: Vec<Value> = state
        .scheduler
        .jobs()
        .into_iter()
        .map(|job| {
            let running = state.scheduler.is_running(&job.job_id);
            json!({
                "job_id": job.job_id,
                "action": job.action,
                "trigger": job.trigger.to_string(),
                "next_fire": job.next_fire.to_rfc3339(),
                "running": running,
            })
        })
        .collect();
    Json(json!({ "jobs": jobs }))
}
