//! Prometheus-compatible TSDB client
//!
//! Reads use the HTTP range-query API. Writes use the text exposition format
//! with explicit timestamps, accepted by the import endpoint of
//! Prometheus-compatible stores (`/api/v1/import/prometheus`).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openanomaly_core::domain::series::{Sample, Series, WritePoint};
use openanomaly_core::duration::PromDuration;
use openanomaly_core::error::TaskError;
use openanomaly_core::tsdb::TsdbClient;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    write_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<MatrixData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatrixData {
    result_type: String,
    #[serde(default)]
    result: Vec<MatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl PrometheusClient {
    /// Create a client
    ///
    /// # Arguments
    /// * `base_url` - Query API base (e.g., "http://prometheus:9090")
    /// * `write_url` - Full URL of the text-format import endpoint
    /// * `client` - HTTP client, normally configured with a request timeout
    pub fn new(base_url: impl Into<String>, write_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            write_url: write_url.into(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TsdbClient for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: PromDuration,
    ) -> Result<Vec<Series>, TaskError> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(start)),
            ("end", unix_seconds(end)),
            ("step", format!("{}", step.as_secs_f64())),
        ];
        debug!(query, %start, %end, "querying tsdb");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| TaskError::Transport(format!("tsdb query failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TaskError::Transport(format!("tsdb response unreadable: {e}")))?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            // Prometheus answers bad PromQL with 400/422; retrying cannot help.
            return Err(TaskError::ConfigValidation(format!(
                "tsdb rejected query '{query}': {}",
                api_error(&body)
            )));
        }
        if !status.is_success() {
            return Err(TaskError::Transport(format!(
                "tsdb returned {status}: {}",
                api_error(&body)
            )));
        }

        parse_matrix(&body)
    }

    async fn write(&self, points: &[WritePoint]) -> Result<(), TaskError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = render_exposition(points);

        let response = self
            .client
            .post(&self.write_url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .map_err(|e| TaskError::Transport(format!("tsdb write failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TaskError::Transport(format!("tsdb write returned {status}: {text}")));
        }
        Ok(())
    }
}

fn unix_seconds(t: DateTime<Utc>) -> String {
    format!("{:.3}", t.timestamp_millis() as f64 / 1000.0)
}

fn api_error(body: &str) -> String {
    serde_json::from_str::<ApiResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Parse a `query_range` response body into series, dropping NaN samples.
pub fn parse_matrix(body: &str) -> Result<Vec<Series>, TaskError> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| TaskError::Transport(format!("tsdb response is not valid JSON: {e}")))?;

    if response.status != "success" {
        return Err(TaskError::Transport(format!(
            "tsdb query failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        )));
    }
    let Some(data) = response.data else {
        return Ok(Vec::new());
    };
    if data.result_type != "matrix" {
        return Err(TaskError::ConfigValidation(format!(
            "expected a range vector, got '{}'",
            data.result_type
        )));
    }

    data.result
        .into_iter()
        .map(|series| {
            let samples = series
                .values
                .into_iter()
                .filter_map(|(ts, raw)| {
                    let value: f64 = match raw.parse() {
                        Ok(v) => v,
                        Err(_) => return Some(Err(raw)),
                    };
                    if value.is_nan() {
                        return None;
                    }
                    let timestamp = DateTime::from_timestamp_millis((ts * 1000.0).round() as i64)?;
                    Some(Ok(Sample::new(timestamp, value)))
                })
                .collect::<Result<Vec<_>, String>>()
                .map_err(|raw| TaskError::Transport(format!("unparseable sample value '{raw}'")))?;
            Ok(Series {
                labels: series.metric,
                samples,
            })
        })
        .collect()
}

/// Render points in the text exposition format, one line per point.
pub fn render_exposition(points: &[WritePoint]) -> String {
    let mut out = String::new();
    for point in points {
        out.push_str(&point.metric);
        if !point.labels.is_empty() {
            out.push('{');
            for (i, (name, value)) in point.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
            }
            out.push('}');
        }
        let _ = writeln!(
            out,
            " {} {}",
            format_value(point.value),
            point.timestamp.timestamp_millis()
        );
    }
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_render_exposition_sorts_and_escapes_labels() {
        let points = vec![
            WritePoint::new("openanomaly_anomaly_score", noon(), 3.25)
                .label("pipeline", "cpu_anomaly"),
            WritePoint::new("openanomaly_forecast", noon(), 10.0)
                .label("type", "mean")
                .label("pipeline", "say \"hi\""),
        ];
        let text = render_exposition(&points);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "openanomaly_anomaly_score{pipeline=\"cpu_anomaly\"} 3.25 1772452800000"
        );
        assert_eq!(
            lines[1],
            "openanomaly_forecast{pipeline=\"say \\\"hi\\\"\",type=\"mean\"} 10 1772452800000"
        );
    }

    #[test]
    fn test_parse_matrix_drops_nan() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"instance": "a"},
                    "values": [[1772452800, "1.5"], [1772452860, "NaN"], [1772452920, "2"]]
                }]
            }
        }"#;
        let series = parse_matrix(body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label("instance"), Some("a"));
        assert_eq!(series[0].samples.len(), 2);
        assert_eq!(series[0].samples[0], Sample::new(noon(), 1.5));
    }

    #[test]
    fn test_parse_matrix_error_status() {
        let body = r#"{"status": "error", "errorType": "bad_data", "error": "parse error"}"#;
        let err = parse_matrix(body).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[tokio::test]
    async fn test_query_range_against_stub_server() {
        async fn handler(Query(params): Query<HashMap<String, String>>) -> String {
            assert_eq!(params.get("step").map(String::as_str), Some("60"));
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{},"values":[[1772452800,"10"],[1772452860,"11"]]}]}}"#
                .to_string()
        }

        let app = Router::new().route("/api/v1/query_range", get(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = PrometheusClient::new(
            format!("http://{addr}/"),
            format!("http://{addr}/api/v1/import/prometheus"),
            Client::new(),
        );
        let series = client
            .query_range(
                "avg(node_load1)",
                noon() - chrono::Duration::minutes(1),
                noon(),
                PromDuration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(series[0].samples.len(), 2);
        assert_eq!(series[0].samples[1].value, 11.0);
    }
}
