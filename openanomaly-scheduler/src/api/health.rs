//! Health and leadership handlers

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use openanomaly_core::dto::leader::LeaderStatus;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/leader
/// Role of this instance and the lease it observes
pub async fn leader_status(State(state): State<AppState>) -> ApiResult<Json<LeaderStatus>> {
    let lease = state.lease.current().await?;

    Ok(Json(LeaderStatus {
        instance_id: state.elector.instance_id().to_string(),
        leadership: state.elector.leadership(),
        lease,
    }))
}
