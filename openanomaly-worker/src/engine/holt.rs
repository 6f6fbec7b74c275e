//! Holt's linear trend method (double exponential smoothing)
//!
//! `alpha` smooths the level and `beta` the trend. Training grid-searches
//! both on one-step-ahead squared error; the winners travel in the
//! artifact and take precedence over the pipeline's own parameters.

use async_trait::async_trait;
use chrono::Utc;
use openanomaly_core::domain::result::{Forecast, QuantileSeries, TrainingArtifact};
use openanomaly_core::domain::series::Sample;
use openanomaly_core::engine::{ForecastRequest, ModelEngine, TrainRequest};
use openanomaly_core::error::TaskError;

use super::{empirical_quantile, param_f64, require_context};

const DEFAULT_ALPHA: f64 = 0.5;
const DEFAULT_BETA: f64 = 0.1;
const GRID: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

#[derive(Debug, Clone, Copy, Default)]
pub struct Holt;

struct Fit {
    level: f64,
    trend: f64,
    errors: Vec<f64>,
}

impl Fit {
    fn sse(&self) -> f64 {
        self.errors.iter().map(|e| e * e).sum()
    }
}

fn fit(values: &[f64], alpha: f64, beta: f64) -> Fit {
    let mut level = values[0];
    let mut trend = values[1] - values[0];
    let mut errors = Vec::with_capacity(values.len() - 1);

    for &x in &values[1..] {
        let predicted = level + trend;
        errors.push(x - predicted);
        let next_level = alpha * x + (1.0 - alpha) * predicted;
        trend = beta * (next_level - level) + (1.0 - beta) * trend;
        level = next_level;
    }

    Fit {
        level,
        trend,
        errors,
    }
}

impl Holt {
    fn smoothing(request: &ForecastRequest) -> (f64, f64) {
        let fitted = request.artifact.as_ref().map(|a| &a.parameters);
        let pick = |key: &str, default: f64| {
            fitted
                .and_then(|p| param_f64(p, key))
                .or_else(|| param_f64(&request.parameters, key))
                .filter(|v| *v > 0.0 && *v <= 1.0)
                .unwrap_or(default)
        };
        (pick("alpha", DEFAULT_ALPHA), pick("beta", DEFAULT_BETA))
    }
}

#[async_trait]
impl ModelEngine for Holt {
    fn name(&self) -> String {
        "local:holt".to_string()
    }

    async fn predict(
        &self,
        context: &[Sample],
        request: &ForecastRequest,
    ) -> Result<Forecast, TaskError> {
        require_context(context, 2, "holt")?;

        let values: Vec<f64> = context.iter().map(|s| s.value).collect();
        let (alpha, beta) = Self::smoothing(request);
        let fit = fit(&values, alpha, beta);

        let mean: Vec<f64> = (1..=request.prediction_length)
            .map(|k| fit.level + k as f64 * fit.trend)
            .collect();

        let quantiles = request
            .quantiles
            .iter()
            .map(|&level| {
                let offset = empirical_quantile(&fit.errors, level);
                QuantileSeries {
                    level,
                    values: mean
                        .iter()
                        .enumerate()
                        .map(|(k, m)| m + offset * ((k + 1) as f64).sqrt())
                        .collect(),
                }
            })
            .collect();

        Ok(Forecast { mean, quantiles })
    }

    async fn train(
        &self,
        history: &[Sample],
        request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError> {
        require_context(history, 3, "holt training")?;
        let values: Vec<f64> = history.iter().map(|s| s.value).collect();

        let mut best = (DEFAULT_ALPHA, DEFAULT_BETA, f64::INFINITY);
        for alpha in GRID {
            for beta in GRID {
                let sse = fit(&values, alpha, beta).sse();
                if sse < best.2 {
                    best = (alpha, beta, sse);
                }
            }
        }
        let (alpha, beta, sse) = best;
        tracing::debug!(pipeline = %request.pipeline, alpha, beta, sse, "holt fitted");

        let mut parameters = request.parameters.clone();
        parameters.insert("alpha".to_string(), serde_json::json!(alpha));
        parameters.insert("beta".to_string(), serde_json::json!(beta));
        parameters.insert("sse".to_string(), serde_json::json!(sse));
        parameters.insert("points".to_string(), serde_json::json!(values.len()));

        Ok(TrainingArtifact {
            pipeline: request.pipeline.clone(),
            model_id: "holt".to_string(),
            trained_at: Utc::now(),
            window_start: request.window_start,
            window_end: request.window_end,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use openanomaly_core::duration::PromDuration;
    use std::collections::BTreeMap;

    fn samples(values: impl IntoIterator<Item = f64>) -> Vec<Sample> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Sample::new(t0 + Duration::minutes(i as i64), v))
            .collect()
    }

    fn request(length: usize, artifact: Option<TrainingArtifact>) -> ForecastRequest {
        ForecastRequest {
            prediction_length: length,
            step: PromDuration::from_secs(60),
            quantiles: vec![0.5],
            parameters: BTreeMap::new(),
            artifact,
        }
    }

    #[tokio::test]
    async fn test_extrapolates_linear_trend() {
        let ctx = samples((0..10).map(|i| 2.0 * i as f64 + 1.0));
        let forecast = Holt.predict(&ctx, &request(3, None)).await.unwrap();
        for (got, want) in forecast.mean.iter().zip([21.0, 23.0, 25.0]) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert_eq!(forecast.quantiles[0].values, forecast.mean);
    }

    #[tokio::test]
    async fn test_train_returns_fitted_parameters() {
        let history = samples((0..60).map(|i| 10.0 + (i as f64 * 0.7).sin() + 0.1 * i as f64));
        let t0 = history[0].timestamp;
        let request = TrainRequest {
            pipeline: "cpu".to_string(),
            step: PromDuration::from_secs(60),
            window_start: t0,
            window_end: t0 + Duration::hours(1),
            parameters: BTreeMap::new(),
        };

        let artifact = Holt.train(&history, &request).await.unwrap();
        assert_eq!(artifact.pipeline, "cpu");
        assert_eq!(artifact.model_id, "holt");
        let alpha = artifact.parameters["alpha"].as_f64().unwrap();
        let beta = artifact.parameters["beta"].as_f64().unwrap();
        assert!(GRID.contains(&alpha) && GRID.contains(&beta));

        // The artifact's parameters drive the next prediction.
        let with_artifact = request_with(&artifact);
        assert_eq!(Holt::smoothing(&with_artifact), (alpha, beta));
    }

    fn request_with(artifact: &TrainingArtifact) -> ForecastRequest {
        let mut r = request(1, Some(artifact.clone()));
        r.parameters.insert("alpha".to_string(), serde_json::json!(0.99));
        r
    }

    #[tokio::test]
    async fn test_train_needs_history() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = TrainRequest {
            pipeline: "cpu".to_string(),
            step: PromDuration::from_secs(60),
            window_start: t0,
            window_end: t0,
            parameters: BTreeMap::new(),
        };
        let err = Holt.train(&samples([1.0, 2.0]), &request).await.unwrap_err();
        assert!(matches!(err, TaskError::DataUnavailable(_)));
    }
}
