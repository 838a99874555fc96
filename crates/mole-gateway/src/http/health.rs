use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = if state.scheduler.is_stopped() {
        "stopping"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "tick_ms": state.config.scheduler.tick_millis,
        "jobs": state.scheduler.job_ids().len(),
    }))
}
