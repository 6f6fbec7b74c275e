//! Model engines
//!
//! Pipelines name their backend in config; [`ModelBackend`] is the closed set
//! of variants that name can resolve to. It is built once per job from the
//! pipeline snapshot.

mod holt;
mod seasonal_naive;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use openanomaly_client::RemoteModelEngine;
use openanomaly_core::domain::pipeline::{LocalBackend, ModelKind, Pipeline};
use openanomaly_core::domain::result::{Forecast, TrainingArtifact};
use openanomaly_core::domain::series::Sample;
use openanomaly_core::engine::{ForecastRequest, ModelEngine, TrainRequest};
use openanomaly_core::error::TaskError;

pub use holt::Holt;
pub use seasonal_naive::SeasonalNaive;

/// Resolves the engine a pipeline runs on
pub trait EngineProvider: Send + Sync {
    fn engine_for(&self, pipeline: &Pipeline) -> Result<Arc<dyn ModelEngine>, TaskError>;
}

pub enum ModelBackend {
    SeasonalNaive(SeasonalNaive),
    Holt(Holt),
    Remote(RemoteModelEngine),
}

impl ModelBackend {
    pub fn from_pipeline(pipeline: &Pipeline, http: &reqwest::Client) -> Result<Self, TaskError> {
        let model = &pipeline.model;
        match model.kind {
            ModelKind::Local => match model.local_backend() {
                Some(LocalBackend::SeasonalNaive) => {
                    Ok(ModelBackend::SeasonalNaive(SeasonalNaive))
                }
                Some(LocalBackend::Holt) => Ok(ModelBackend::Holt(Holt)),
                None => Err(TaskError::ConfigValidation(format!(
                    "unknown local model '{}'",
                    model.id.as_deref().unwrap_or_default()
                ))),
            },
            ModelKind::Remote => {
                let endpoint = model.endpoint.clone().ok_or_else(|| {
                    TaskError::ConfigValidation("remote model has no endpoint".to_string())
                })?;
                let train_url = pipeline.training.as_ref().and_then(|t| t.endpoint.clone());
                Ok(ModelBackend::Remote(RemoteModelEngine::new(
                    endpoint,
                    train_url,
                    model.serialization_format,
                    http.clone(),
                )))
            }
        }
    }
}

#[async_trait]
impl ModelEngine for ModelBackend {
    fn name(&self) -> String {
        match self {
            ModelBackend::SeasonalNaive(e) => e.name(),
            ModelBackend::Holt(e) => e.name(),
            ModelBackend::Remote(e) => e.name(),
        }
    }

    async fn predict(
        &self,
        context: &[Sample],
        request: &ForecastRequest,
    ) -> Result<Forecast, TaskError> {
        match self {
            ModelBackend::SeasonalNaive(e) => e.predict(context, request).await,
            ModelBackend::Holt(e) => e.predict(context, request).await,
            ModelBackend::Remote(e) => e.predict(context, request).await,
        }
    }

    async fn train(
        &self,
        history: &[Sample],
        request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError> {
        match self {
            ModelBackend::SeasonalNaive(e) => e.train(history, request).await,
            ModelBackend::Holt(e) => e.train(history, request).await,
            ModelBackend::Remote(e) => e.train(history, request).await,
        }
    }
}

/// Builds a [`ModelBackend`] per pipeline, sharing one HTTP client
pub struct BackendFactory {
    http: reqwest::Client,
}

impl BackendFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl EngineProvider for BackendFactory {
    fn engine_for(&self, pipeline: &Pipeline) -> Result<Arc<dyn ModelEngine>, TaskError> {
        Ok(Arc::new(ModelBackend::from_pipeline(pipeline, &self.http)?))
    }
}

// =============================================================================
// Shared helpers for local backends
// =============================================================================

fn param_f64(parameters: &BTreeMap<String, serde_json::Value>, key: &str) -> Option<f64> {
    parameters.get(key).and_then(serde_json::Value::as_f64)
}

/// Linear-interpolated quantile of an unsorted sample.
fn empirical_quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn require_context(context: &[Sample], min: usize, model: &str) -> Result<(), TaskError> {
    if context.len() < min {
        return Err(TaskError::DataUnavailable(format!(
            "{model} needs at least {min} points, got {}",
            context.len()
        )));
    }
    Ok(())
}
