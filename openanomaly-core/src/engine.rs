//! Model engine port
//!
//! Every backend, local or remote, sits behind [`ModelEngine`] so the worker
//! treats them interchangeably.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::result::{Forecast, TrainingArtifact};
use crate::domain::series::Sample;
use crate::duration::PromDuration;
use crate::error::TaskError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub prediction_length: usize,
    pub step: PromDuration,
    pub quantiles: Vec<f64>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub artifact: Option<TrainingArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub pipeline: String,
    pub step: PromDuration,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Identifier used in logs and artifacts, e.g. `local:holt`
    fn name(&self) -> String;

    /// Predicts `request.prediction_length` points following `context`
    async fn predict(
        &self,
        context: &[Sample],
        request: &ForecastRequest,
    ) -> Result<Forecast, TaskError>;

    /// Fits the model on `history` and returns the resulting artifact
    async fn train(
        &self,
        history: &[Sample],
        request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError>;
}
