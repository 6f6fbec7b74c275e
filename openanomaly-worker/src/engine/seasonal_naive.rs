//! Seasonal naive backend
//!
//! Repeats the last observed season. Quantile bands come from the spread of
//! past seasonal differences and widen with every season predicted ahead.

use async_trait::async_trait;
use openanomaly_core::domain::result::{Forecast, QuantileSeries, TrainingArtifact};
use openanomaly_core::domain::series::Sample;
use openanomaly_core::engine::{ForecastRequest, ModelEngine, TrainRequest};
use openanomaly_core::error::TaskError;

use super::{empirical_quantile, param_f64, require_context};

#[derive(Debug, Clone, Copy, Default)]
pub struct SeasonalNaive;

impl SeasonalNaive {
    /// `season_length` parameter in steps; falls back to 1 (plain naive)
    /// when missing or longer than the context allows.
    fn season_length(request: &ForecastRequest, context_len: usize) -> usize {
        let season = param_f64(&request.parameters, "season_length")
            .filter(|s| *s >= 1.0)
            .map(|s| s as usize)
            .unwrap_or(1);
        if season >= context_len { 1 } else { season }
    }
}

#[async_trait]
impl ModelEngine for SeasonalNaive {
    fn name(&self) -> String {
        "local:seasonal_naive".to_string()
    }

    async fn predict(
        &self,
        context: &[Sample],
        request: &ForecastRequest,
    ) -> Result<Forecast, TaskError> {
        require_context(context, 2, "seasonal_naive")?;

        let values: Vec<f64> = context.iter().map(|s| s.value).collect();
        let season = Self::season_length(request, values.len());
        let last_season = &values[values.len() - season..];

        let mean: Vec<f64> = (0..request.prediction_length)
            .map(|k| last_season[k % season])
            .collect();

        let differences: Vec<f64> = (season..values.len())
            .map(|i| values[i] - values[i - season])
            .collect();

        let quantiles = request
            .quantiles
            .iter()
            .map(|&level| {
                let offset = empirical_quantile(&differences, level);
                QuantileSeries {
                    level,
                    values: mean
                        .iter()
                        .enumerate()
                        .map(|(k, m)| m + offset * ((k / season + 1) as f64).sqrt())
                        .collect(),
                }
            })
            .collect();

        Ok(Forecast { mean, quantiles })
    }

    async fn train(
        &self,
        _history: &[Sample],
        _request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError> {
        Err(TaskError::ConfigValidation(
            "seasonal_naive has nothing to train".to_string(),
        ))
    }
}
