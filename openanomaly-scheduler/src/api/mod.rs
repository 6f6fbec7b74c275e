//! API Module
//!
//! HTTP API of the scheduler. Workers use it as their job queue and result
//! ledger; the CLI uses it for pipelines, triggers and leadership.

pub mod error;
pub mod health;
pub mod job;
pub mod ledger;
pub mod pipeline;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use openanomaly_core::store::{JobQueue, LeaseStore, PipelineRegistry, ResultLedger};
use tower_http::trace::TraceLayer;

use crate::service::LeaderElector;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn PipelineRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<dyn ResultLedger>,
    pub lease: Arc<dyn LeaseStore>,
    pub elector: Arc<LeaderElector>,
    /// Attempts granted to manually triggered jobs
    pub max_attempts: u32,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & leadership
        .route("/health", get(health::health_check))
        .route("/api/leader", get(health::leader_status))
        // Pipeline endpoints
        .route("/api/pipelines", get(pipeline::list_pipelines))
        .route("/api/pipelines/{name}", get(pipeline::get_pipeline))
        .route(
            "/api/pipelines/{name}/trigger/{kind}",
            post(pipeline::trigger_pipeline),
        )
        .route(
            "/api/pipelines/{name}/artifact",
            post(pipeline::record_artifact),
        )
        // Job queue endpoints
        .route("/api/jobs/consume", post(job::consume_job))
        .route("/api/jobs/{id}/complete", post(job::complete_job))
        .route("/api/jobs/{id}/fail", post(job::fail_job))
        // Result ledger endpoints
        .route("/api/ledger/claim", post(ledger::claim))
        .route("/api/ledger/commit", post(ledger::commit))
        .route("/api/ledger/release", post(ledger::release))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
