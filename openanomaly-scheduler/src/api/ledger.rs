//! Result Ledger API Handlers

use std::time::Duration;

use axum::{Json, extract::State, http::StatusCode};
use openanomaly_core::dto::ledger::{ClaimRef, ClaimRequest, ClaimResponse};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /api/ledger/claim
pub async fn claim(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let outcome = state
        .ledger
        .claim(
            &req.key,
            &req.claim_token,
            Duration::from_secs(req.stale_after_secs),
        )
        .await?;

    Ok(Json(ClaimResponse { outcome }))
}

/// POST /api/ledger/commit
pub async fn commit(
    State(state): State<AppState>,
    Json(req): Json<ClaimRef>,
) -> ApiResult<StatusCode> {
    state.ledger.commit(&req.key, &req.claim_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/ledger/release
pub async fn release(
    State(state): State<AppState>,
    Json(req): Json<ClaimRef>,
) -> ApiResult<StatusCode> {
    state.ledger.release(&req.key, &req.claim_token).await?;
    Ok(StatusCode::NO_CONTENT)
}
