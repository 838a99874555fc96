use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use mole_core::config::MoleConfig;
use mole_scheduler::Scheduler;
use mole_sync::SyncExecutor;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: MoleConfig,
    /// Same instance the clock and reconciler use; ad hoc triggers share its
    /// single-flight slots.
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<SyncExecutor>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: MoleConfig, scheduler: Arc<Scheduler>, executor: Arc<SyncExecutor>) -> Self {
        Self {
            config,
            scheduler,
            executor,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/jobs", get(crate::http::jobs::list_jobs))
        .route("/trigger_sync", post(crate::http::trigger::trigger_sync))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
