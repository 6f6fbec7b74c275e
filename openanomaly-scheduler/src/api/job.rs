//! Job Queue API Handlers
//!
//! The worker side of the queue: consume, complete and fail.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use openanomaly_core::domain::job::Job;
use openanomaly_core::dto::job::{CompleteJob, ConsumeRequest, FailJob};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /api/jobs/consume
/// Take the next visible job, or `null` when the queue is empty
pub async fn consume_job(
    State(state): State<AppState>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<Json<Option<Job>>> {
    let job = state.queue.consume(&req.worker_id).await?;

    if let Some(job) = &job {
        tracing::debug!(
            job_id = %job.id,
            pipeline = %job.pipeline().name,
            attempt = job.attempt,
            worker = %req.worker_id,
            "job delivered"
        );
    }

    Ok(Json(job))
}

/// POST /api/jobs/{id}/complete
/// Acknowledge a job; 409 when the delivery was superseded
pub async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteJob>,
) -> ApiResult<StatusCode> {
    state.queue.complete(id, req.attempt, req.outcome).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/jobs/{id}/fail
/// Report a failed execution
pub async fn fail_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailJob>,
) -> ApiResult<StatusCode> {
    tracing::info!(
        job_id = %id,
        attempt = req.attempt,
        class = %req.class,
        requeue = req.requeue,
        "job failed"
    );

    state.queue.fail(id, req.attempt, req.class, req.requeue).await?;
    Ok(StatusCode::NO_CONTENT)
}
