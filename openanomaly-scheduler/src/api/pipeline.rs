//! Pipeline API Handlers
//!
//! Registry reads, manual triggers and training artifacts.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use openanomaly_core::domain::job::JobKind;
use openanomaly_core::domain::result::TrainingArtifact;
use openanomaly_core::dto::job::TriggerResponse;
use openanomaly_core::dto::pipeline::{PipelineDetail, PipelineSummary};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::pipeline_service;

/// GET /api/pipelines
/// List every stored pipeline, rejected definitions included
pub async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Json<Vec<PipelineSummary>>> {
    let entries = state.registry.list().await?;
    Ok(Json(entries.iter().map(PipelineSummary::from).collect()))
}

/// GET /api/pipelines/{name}
/// Get a pipeline definition and its training artifact
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineDetail>> {
    tracing::debug!("Getting pipeline: {}", name);

    let entry = state
        .registry
        .get(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline '{}' not found", name)))?;

    Ok(Json(entry.into()))
}

/// POST /api/pipelines/{name}/trigger/{kind}
/// Enqueue an out-of-schedule job
pub async fn trigger_pipeline(
    State(state): State<AppState>,
    Path((name, kind)): Path<(String, String)>,
) -> ApiResult<Json<TriggerResponse>> {
    let kind: JobKind = kind.parse().map_err(ApiError::BadRequest)?;

    let response = pipeline_service::trigger(
        state.registry.as_ref(),
        state.queue.as_ref(),
        &name,
        kind,
        state.max_attempts,
        Utc::now(),
    )
    .await?;

    Ok(Json(response))
}

/// POST /api/pipelines/{name}/artifact
/// Record the artifact of a completed training run
pub async fn record_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(artifact): Json<TrainingArtifact>,
) -> ApiResult<StatusCode> {
    if artifact.pipeline != name {
        return Err(ApiError::BadRequest(format!(
            "artifact belongs to '{}', not '{}'",
            artifact.pipeline, name
        )));
    }

    tracing::info!(pipeline = %name, model = %artifact.model_id, "training artifact recorded");
    state.registry.record_artifact(artifact).await?;

    Ok(StatusCode::NO_CONTENT)
}
