//! Remote model engine over HTTP
//!
//! `POST {endpoint}/predict` and `POST {training endpoint}` with either JSON or
//! Arrow IPC bodies. Network failures and error statuses are inference errors
//! (retryable); bodies that cannot be decoded are serialization errors (not
//! retryable).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openanomaly_core::domain::pipeline::SerializationFormat;
use openanomaly_core::domain::result::{Forecast, QuantileSeries, TrainingArtifact};
use openanomaly_core::domain::series::Sample;
use openanomaly_core::engine::{ForecastRequest, ModelEngine, TrainRequest};
use openanomaly_core::error::TaskError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arrow_codec;

#[derive(Debug, Clone)]
pub struct RemoteModelEngine {
    endpoint: String,
    train_url: String,
    format: SerializationFormat,
    client: Client,
}

#[derive(Debug, Serialize)]
struct JsonPredictRequest<'a> {
    context: Vec<f64>,
    prediction_length: usize,
    quantiles: &'a [f64],
    timestamps: Vec<DateTime<Utc>>,
    step_seconds: f64,
    parameters: &'a BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<&'a TrainingArtifact>,
}

#[derive(Debug, Deserialize)]
struct JsonPredictResponse {
    #[serde(alias = "mean")]
    forecast: Vec<f64>,
    #[serde(default)]
    quantiles: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Serialize)]
struct JsonTrainRequest<'a> {
    data: Vec<f64>,
    parameters: &'a BTreeMap<String, serde_json::Value>,
    pipeline: &'a str,
    timestamps: Vec<DateTime<Utc>>,
    step_seconds: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
}

impl RemoteModelEngine {
    /// Create a remote engine
    ///
    /// # Arguments
    /// * `endpoint` - Base URL of the model server
    /// * `train_url` - Training URL; defaults to `{endpoint}/train`
    /// * `format` - Wire format for request and response bodies
    /// * `client` - HTTP client carrying the per-call timeout
    pub fn new(
        endpoint: impl Into<String>,
        train_url: Option<String>,
        format: SerializationFormat,
        client: Client,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let train_url = train_url.unwrap_or_else(|| format!("{endpoint}/train"));
        Self {
            endpoint,
            train_url,
            format,
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `GET {endpoint}/health`
    pub async fn health(&self) -> Result<(), TaskError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
            .map_err(request_failed)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TaskError::Inference(format!(
                "model server health returned {}",
                response.status()
            )))
        }
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<Vec<u8>, TaskError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, content_type)
            .body(body)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(request_failed)?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(TaskError::Inference(format!(
                "model server returned {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(bytes.to_vec())
    }

    fn options_metadata(request: &ForecastRequest) -> Result<HashMap<String, String>, TaskError> {
        let mut metadata = HashMap::from([
            (
                "prediction_length".to_string(),
                request.prediction_length.to_string(),
            ),
            (
                "step_seconds".to_string(),
                request.step.as_secs_f64().to_string(),
            ),
            ("quantiles".to_string(), to_json(&request.quantiles)?),
            ("parameters".to_string(), to_json(&request.parameters)?),
        ]);
        if let Some(artifact) = &request.artifact {
            metadata.insert("artifact".to_string(), to_json(artifact)?);
        }
        Ok(metadata)
    }
}

#[async_trait]
impl ModelEngine for RemoteModelEngine {
    fn name(&self) -> String {
        format!("remote:{}", self.endpoint)
    }

    async fn predict(
        &self,
        context: &[Sample],
        request: &ForecastRequest,
    ) -> Result<Forecast, TaskError> {
        let url = format!("{}/predict", self.endpoint);
        debug!(%url, points = context.len(), "requesting remote forecast");

        let forecast = match self.format {
            SerializationFormat::Json => {
                let body = to_json(&JsonPredictRequest {
                    context: context.iter().map(|s| s.value).collect(),
                    prediction_length: request.prediction_length,
                    quantiles: &request.quantiles,
                    timestamps: context.iter().map(|s| s.timestamp).collect(),
                    step_seconds: request.step.as_secs_f64(),
                    parameters: &request.parameters,
                    artifact: request.artifact.as_ref(),
                })?;
                let bytes = self.post(&url, body.into_bytes(), "application/json").await?;
                decode_json_forecast(&bytes)?
            }
            SerializationFormat::Arrow => {
                let body = arrow_codec::encode_samples(context, Self::options_metadata(request)?)?;
                let bytes = self.post(&url, body, arrow_codec::CONTENT_TYPE).await?;
                arrow_codec::decode_forecast(&bytes)?
            }
        };

        forecast
            .check_shape(request.prediction_length)
            .map_err(TaskError::Serialization)?;
        Ok(forecast)
    }

    async fn train(
        &self,
        history: &[Sample],
        request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError> {
        debug!(url = %self.train_url, points = history.len(), "requesting remote training");

        let bytes = match self.format {
            SerializationFormat::Json => {
                let body = to_json(&JsonTrainRequest {
                    data: history.iter().map(|s| s.value).collect(),
                    parameters: &request.parameters,
                    pipeline: &request.pipeline,
                    timestamps: history.iter().map(|s| s.timestamp).collect(),
                    step_seconds: request.step.as_secs_f64(),
                    window_start: request.window_start,
                    window_end: request.window_end,
                })?;
                self.post(&self.train_url, body.into_bytes(), "application/json")
                    .await?
            }
            SerializationFormat::Arrow => {
                let metadata = HashMap::from([
                    ("pipeline".to_string(), request.pipeline.clone()),
                    (
                        "step_seconds".to_string(),
                        request.step.as_secs_f64().to_string(),
                    ),
                    ("window_start".to_string(), request.window_start.to_rfc3339()),
                    ("window_end".to_string(), request.window_end.to_rfc3339()),
                    ("parameters".to_string(), to_json(&request.parameters)?),
                ]);
                let body = arrow_codec::encode_samples(history, metadata)?;
                self.post(&self.train_url, body, arrow_codec::CONTENT_TYPE)
                    .await?
            }
        };

        // Training responses are small and always JSON.
        let response: TrainResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TaskError::Serialization(format!("invalid training response: {e}")))?;

        Ok(TrainingArtifact {
            pipeline: request.pipeline.clone(),
            model_id: response.model_id.unwrap_or_else(|| self.name()),
            trained_at: Utc::now(),
            window_start: request.window_start,
            window_end: request.window_end,
            parameters: response.parameters,
        })
    }
}

/// Decode a JSON prediction body (`{"forecast": [...], "quantiles": {"0.1": [...]}}`).
///
/// Servers that name the point forecast `mean` are accepted as well.
pub fn decode_json_forecast(bytes: &[u8]) -> Result<Forecast, TaskError> {
    let body: JsonPredictResponse = serde_json::from_slice(bytes)
        .map_err(|e| TaskError::Serialization(format!("invalid forecast response: {e}")))?;

    let mut quantiles = body
        .quantiles
        .into_iter()
        .map(|(level, values)| {
            level
                .parse::<f64>()
                .map(|level| QuantileSeries { level, values })
                .map_err(|_| TaskError::Serialization(format!("invalid quantile key '{level}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    quantiles.sort_by(|a, b| a.level.total_cmp(&b.level));

    Ok(Forecast {
        mean: body.forecast,
        quantiles,
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(|e| TaskError::Serialization(e.to_string()))
}

fn request_failed(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Inference(format!("model server timed out: {err}"))
    } else {
        TaskError::Inference(format!("model server unreachable: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use chrono::TimeZone;
    use openanomaly_core::duration::PromDuration;

    fn context() -> Vec<Sample> {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        (0..60)
            .map(|i| Sample::new(t0 + chrono::Duration::minutes(i), 10.0))
            .collect()
    }

    fn request() -> ForecastRequest {
        ForecastRequest {
            prediction_length: 3,
            step: PromDuration::from_secs(60),
            quantiles: vec![0.1, 0.9],
            parameters: BTreeMap::new(),
            artifact: None,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_decode_json_forecast() {
        let body = br#"{"mean":[10,11],"quantiles":{"0.9":[12,13],"0.1":[8,9]}}"#;
        let forecast = decode_json_forecast(body).unwrap();
        assert_eq!(forecast.mean, vec![10.0, 11.0]);
        assert_eq!(forecast.quantiles[0].level, 0.1);
        assert_eq!(forecast.quantiles[1].values, vec![12.0, 13.0]);

        let err = decode_json_forecast(br#"{"mean":[1],"quantiles":{"p90":[2]}}"#).unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_json_predict() {
        let app = Router::new().route(
            "/predict",
            post(|| async { r#"{"mean":[10,10,10],"quantiles":{"0.1":[8,8,8],"0.9":[12,12,12]}}"# }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Json, Client::new());

        let forecast = engine.predict(&context(), &request()).await.unwrap();
        assert_eq!(forecast.mean, vec![10.0; 3]);
        assert_eq!(forecast.nearest_quantile(0.9).unwrap().values, vec![12.0; 3]);
    }

    #[tokio::test]
    async fn test_json_predict_sends_context_and_reads_forecast() {
        let app = Router::new().route(
            "/predict",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["context"].as_array().map(Vec::len), Some(60));
                assert_eq!(body["prediction_length"], 3);
                assert_eq!(body["quantiles"], serde_json::json!([0.1, 0.9]));
                r#"{"forecast":[10,10,10],"quantiles":{"0.9":[12,12,12]}}"#
            }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Json, Client::new());

        let forecast = engine.predict(&context(), &request()).await.unwrap();
        assert_eq!(forecast.mean, vec![10.0; 3]);
        assert_eq!(forecast.quantiles.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_arrow_response_is_serialization_error() {
        let app = Router::new().route(
            "/predict",
            post(|| async { vec![8u8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8] }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Arrow, Client::new());

        let err = engine.predict(&context(), &request()).await.unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_arrow_predict() {
        let app = Router::new().route(
            "/predict",
            post(|body: axum::body::Bytes| async move {
                let (samples, metadata) = arrow_codec::decode_samples(&body).unwrap();
                assert_eq!(samples.len(), 60);
                assert_eq!(metadata.get("prediction_length").map(String::as_str), Some("3"));
                arrow_codec::encode_forecast(&Forecast {
                    mean: vec![10.0; 3],
                    quantiles: vec![QuantileSeries { level: 0.9, values: vec![12.0; 3] }],
                })
                .unwrap()
            }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Arrow, Client::new());

        let forecast = engine.predict(&context(), &request()).await.unwrap();
        assert_eq!(forecast.mean.len(), 3);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_inference_error() {
        let app = Router::new().route(
            "/predict",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model crashed") }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Json, Client::new());

        let err = engine.predict(&context(), &request()).await.unwrap_err();
        assert!(matches!(err, TaskError::Inference(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_short_forecast_is_rejected() {
        let app = Router::new().route("/predict", post(|| async { r#"{"mean":[10]}"# }));
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Json, Client::new());

        let err = engine.predict(&context(), &request()).await.unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_train_builds_artifact() {
        let app = Router::new().route(
            "/train",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["data"].as_array().map(Vec::len), Some(60));
                assert!(body["parameters"].is_object());
                r#"{"model_id":"chronos-ft-42","parameters":{"epochs":3}}"#
            }),
        );
        let url = serve(app).await;
        let engine = RemoteModelEngine::new(url, None, SerializationFormat::Json, Client::new());
        let now = Utc::now();
        let artifact = engine
            .train(
                &context(),
                &TrainRequest {
                    pipeline: "cpu".into(),
                    step: PromDuration::from_secs(60),
                    window_start: now - chrono::Duration::days(1),
                    window_end: now,
                    parameters: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(artifact.model_id, "chronos-ft-42");
        assert_eq!(artifact.parameters["epochs"], 3);
    }
}
