//! Pipeline domain types
//!
//! A pipeline is the unit of scheduling: one metric query, one model, one
//! mode, with independent cron schedules for forecasting, anomaly scoring and
//! training. Definitions are strict: unknown fields are rejected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::job::JobKind;
use crate::duration::PromDuration;
use crate::error::ConfigError;
use crate::schedule::CronSchedule;

/// Quantile levels requested from every model.
pub const DEFAULT_QUANTILES: &[f64] = &[0.1, 0.5, 0.9, 0.95, 0.99];

/// Upper bound for every duration in a definition (ten years).
pub const MAX_SPAN: PromDuration = PromDuration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub query: String,
    #[serde(default = "default_step")]
    pub step: PromDuration,
    #[serde(default = "default_context_window")]
    pub context_window: PromDuration,
    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: PromDuration,
    #[serde(default)]
    pub mode: PipelineMode,
    #[serde(default = "default_forecast_schedule")]
    pub forecast_schedule: String,
    #[serde(default = "default_anomaly_schedule")]
    pub anomaly_schedule: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    ForecastOnly,
    AnomalyOnly,
    #[default]
    ForecastAndAnomaly,
}

impl PipelineMode {
    /// Whether forecast ticks are scheduled and forecasts written.
    pub fn writes_forecasts(&self) -> bool {
        matches!(self, PipelineMode::ForecastOnly | PipelineMode::ForecastAndAnomaly)
    }

    /// Whether anomaly ticks are scheduled.
    pub fn scores_anomalies(&self) -> bool {
        matches!(self, PipelineMode::AnomalyOnly | PipelineMode::ForecastAndAnomaly)
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineMode::ForecastOnly => "forecast_only",
            PipelineMode::AnomalyOnly => "anomaly_only",
            PipelineMode::ForecastAndAnomaly => "forecast_and_anomaly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    #[default]
    Json,
    Arrow,
}

/// In-process model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalBackend {
    SeasonalNaive,
    Holt,
}

impl LocalBackend {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "seasonal_naive" => Some(LocalBackend::SeasonalNaive),
            "holt" => Some(LocalBackend::Holt),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            LocalBackend::SeasonalNaive => "seasonal_naive",
            LocalBackend::Holt => "holt",
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, LocalBackend::Holt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub kind: ModelKind,
    /// Local backend identifier, required for `local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Inference base URL, required for `remote`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub serialization_format: SerializationFormat,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ModelConfig {
    pub fn local_backend(&self) -> Option<LocalBackend> {
        match self.kind {
            ModelKind::Local => self.id.as_deref().and_then(LocalBackend::from_id),
            ModelKind::Remote => None,
        }
    }

    /// Short human-readable identifier, e.g. `local:holt`.
    pub fn describe(&self) -> String {
        match self.kind {
            ModelKind::Local => format!("local:{}", self.id.as_deref().unwrap_or("?")),
            ModelKind::Remote => format!("remote:{}", self.endpoint.as_deref().unwrap_or("?")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyTechnique {
    #[default]
    ConfidenceInterval,
    ZScore,
    Iqr,
    IsolationForest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyConfig {
    #[serde(default)]
    pub technique: AnomalyTechnique,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Span of past residuals used by the history-based techniques.
    #[serde(default = "default_history_window")]
    pub history_window: PromDuration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            technique: AnomalyTechnique::default(),
            confidence_level: default_confidence_level(),
            threshold: default_threshold(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_training_schedule")]
    pub schedule: String,
    #[serde(default = "default_training_window")]
    pub window: PromDuration,
    /// Training URL for remote models; defaults to `{endpoint}/train`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub write_forecast: bool,
    #[serde(default = "default_true")]
    pub write_anomaly_score: bool,
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            write_forecast: true,
            write_anomaly_score: true,
            metric_prefix: default_metric_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_step() -> PromDuration {
    PromDuration::from_secs(60)
}

fn default_context_window() -> PromDuration {
    PromDuration::from_secs(3600)
}

fn default_prediction_horizon() -> PromDuration {
    PromDuration::from_secs(15 * 60)
}

fn default_forecast_schedule() -> String {
    "*/5 * * * *".to_string()
}

fn default_anomaly_schedule() -> String {
    "*/1 * * * *".to_string()
}

fn default_training_schedule() -> String {
    "0 0 * * *".to_string()
}

fn default_training_window() -> PromDuration {
    PromDuration::from_secs(30 * 86_400)
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_threshold() -> f64 {
    3.0
}

fn default_history_window() -> PromDuration {
    PromDuration::from_secs(6 * 3600)
}

fn default_metric_prefix() -> String {
    "openanomaly_".to_string()
}

impl Pipeline {
    pub fn forecast_metric(&self) -> String {
        format!("{}forecast", self.output.metric_prefix)
    }

    pub fn anomaly_metric(&self) -> String {
        format!("{}anomaly_score", self.output.metric_prefix)
    }

    /// Number of points the model is asked to predict.
    pub fn prediction_length(&self) -> usize {
        self.prediction_horizon.steps_of(self.step) as usize
    }

    /// Points a full context window holds.
    pub fn context_points(&self) -> usize {
        self.context_window.steps_of(self.step) as usize
    }

    pub fn training_enabled(&self) -> bool {
        self.training.as_ref().is_some_and(|t| t.enabled)
    }

    /// Cron expression driving `kind`, or `None` when the mode or training
    /// settings leave that kind unscheduled.
    pub fn schedule_for(&self, kind: JobKind) -> Option<&str> {
        match kind {
            JobKind::Forecast if self.mode.writes_forecasts() => Some(&self.forecast_schedule),
            JobKind::Anomaly if self.mode.scores_anomalies() => Some(&self.anomaly_schedule),
            JobKind::Train if self.training_enabled() => {
                self.training.as_ref().map(|t| t.schedule.as_str())
            }
            _ => None,
        }
    }

    /// Validate the definition, collecting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.name.is_empty() {
            issues.push("name must not be empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            issues.push("name may only contain letters, digits, '_' and '-'".to_string());
        }
        if self.query.trim().is_empty() {
            issues.push("query must not be empty".to_string());
        }

        if self.step.is_zero() {
            issues.push("step must be positive".to_string());
        } else {
            if self.context_points() < 2 {
                issues.push(format!(
                    "context_window {} must span at least two steps of {}",
                    self.context_window, self.step
                ));
            }
            if self.prediction_length() < 1 {
                issues.push(format!(
                    "prediction_horizon {} must be at least one step of {}",
                    self.prediction_horizon, self.step
                ));
            }
        }

        let mut spans = vec![
            ("step", self.step),
            ("context_window", self.context_window),
            ("prediction_horizon", self.prediction_horizon),
            ("anomaly.history_window", self.anomaly.history_window),
        ];
        if let Some(training) = &self.training {
            spans.push(("training.window", training.window));
        }
        for (field, span) in spans {
            if span > MAX_SPAN {
                issues.push(format!("{field} {span} exceeds the maximum of {MAX_SPAN}"));
            }
        }

        for (field, expr) in [
            ("forecast_schedule", &self.forecast_schedule),
            ("anomaly_schedule", &self.anomaly_schedule),
        ] {
            if let Err(e) = CronSchedule::parse(expr) {
                issues.push(format!("{field}: {e}"));
            }
        }

        match self.model.kind {
            ModelKind::Local => match self.model.id.as_deref() {
                None | Some("") => issues.push("model.id is required for local models".to_string()),
                Some(id) if LocalBackend::from_id(id).is_none() => {
                    issues.push(format!("model.id '{id}' is not a known local model"))
                }
                Some(_) => {}
            },
            ModelKind::Remote => match self.model.endpoint.as_deref() {
                None | Some("") => {
                    issues.push("model.endpoint is required for remote models".to_string())
                }
                Some(url) if !is_http_url(url) => {
                    issues.push(format!("model.endpoint '{url}' must be an http(s) URL"))
                }
                Some(_) => {}
            },
        }

        let anomaly = &self.anomaly;
        if !(0.0..=1.0).contains(&anomaly.confidence_level) {
            issues.push(format!(
                "anomaly.confidence_level {} must be within [0, 1]",
                anomaly.confidence_level
            ));
        }
        if !anomaly.threshold.is_finite() || anomaly.threshold <= 0.0 {
            issues.push(format!("anomaly.threshold {} must be positive", anomaly.threshold));
        }
        if anomaly.technique != AnomalyTechnique::ConfidenceInterval
            && anomaly.history_window.is_zero()
        {
            issues.push("anomaly.history_window must be positive".to_string());
        }

        if let Some(training) = &self.training {
            if training.enabled {
                if let Err(e) = CronSchedule::parse(&training.schedule) {
                    issues.push(format!("training.schedule: {e}"));
                }
                if training.window.is_zero() {
                    issues.push("training.window must be positive".to_string());
                }
                if let Some(backend) = self.model.local_backend() {
                    if !backend.is_trainable() {
                        issues.push(format!(
                            "training is enabled but local model '{}' is not trainable",
                            backend.id()
                        ));
                    }
                }
                if let Some(url) = training.endpoint.as_deref() {
                    if !is_http_url(url) {
                        issues.push(format!("training.endpoint '{url}' must be an http(s) URL"));
                    }
                }
            }
        }

        let prefix = &self.output.metric_prefix;
        if !prefix.is_empty() && !is_metric_name(prefix) {
            issues.push(format!("output.metric_prefix '{prefix}' is not a valid metric name prefix"));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                pipeline: self.name.clone(),
                issues,
            })
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
name: cpu
query: avg(rate(node_cpu_seconds_total{mode!="idle"}[1m]))
model:
  type: local
  id: seasonal_naive
"#
    }

    #[test]
    fn test_defaults_applied() {
        let pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(pipeline.enabled);
        assert_eq!(pipeline.step, PromDuration::from_secs(60));
        assert_eq!(pipeline.context_window, PromDuration::from_secs(3600));
        assert_eq!(pipeline.prediction_horizon, PromDuration::from_secs(900));
        assert_eq!(pipeline.mode, PipelineMode::ForecastAndAnomaly);
        assert_eq!(pipeline.forecast_schedule, "*/5 * * * *");
        assert_eq!(pipeline.anomaly_schedule, "*/1 * * * *");
        assert_eq!(pipeline.anomaly.confidence_level, 0.95);
        assert_eq!(pipeline.anomaly.threshold, 3.0);
        assert_eq!(pipeline.output.metric_prefix, "openanomaly_");
        assert_eq!(pipeline.prediction_length(), 15);
        assert_eq!(pipeline.context_points(), 60);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = format!("{}\nretries: 3\n", minimal_yaml());
        let err = serde_yaml::from_str::<Pipeline>(&yaml).unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn test_confidence_level_out_of_range_rejected() {
        let mut pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        pipeline.anomaly.confidence_level = 1.5;
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("confidence_level"));
    }

    #[test]
    fn test_validation_collects_all_issues() {
        let mut pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        pipeline.forecast_schedule = "soon".into();
        pipeline.model.id = Some("prophet".into());
        pipeline.anomaly.threshold = 0.0;
        match pipeline.validate() {
            Err(ConfigError::Invalid { pipeline, issues }) => {
                assert_eq!(pipeline, "cpu");
                assert_eq!(issues.len(), 3);
            }
            other => panic!("expected invalid pipeline, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_model_requires_endpoint() {
        let yaml = r#"
name: latency
query: histogram_quantile(0.99, rate(http_duration_seconds_bucket[5m]))
model:
  type: remote
"#;
        let pipeline: Pipeline = serde_yaml::from_str(yaml).unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("model.endpoint"));
    }

    #[test]
    fn test_training_requires_trainable_model() {
        let yaml = format!("{}training:\n  window: 7d\n", minimal_yaml());
        let pipeline: Pipeline = serde_yaml::from_str(&yaml).unwrap();
        assert!(pipeline.training_enabled());
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("not trainable"));
    }

    #[test]
    fn test_schedule_for_follows_mode_and_training() {
        let mut pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(pipeline.schedule_for(JobKind::Forecast), Some("*/5 * * * *"));
        assert_eq!(pipeline.schedule_for(JobKind::Anomaly), Some("*/1 * * * *"));
        assert_eq!(pipeline.schedule_for(JobKind::Train), None);

        pipeline.mode = PipelineMode::ForecastOnly;
        assert_eq!(pipeline.schedule_for(JobKind::Anomaly), None);

        pipeline.mode = PipelineMode::AnomalyOnly;
        assert_eq!(pipeline.schedule_for(JobKind::Forecast), None);
        assert!(pipeline.schedule_for(JobKind::Anomaly).is_some());
    }

    #[test]
    fn test_context_window_shorter_than_two_steps_rejected() {
        let mut pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        pipeline.context_window = PromDuration::from_secs(60);
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let yaml = format!("{}context_window: 20000000w\ntraining:\n  enabled: false\n  window: 5000w\n", minimal_yaml());
        let pipeline: Pipeline = serde_yaml::from_str(&yaml).unwrap();
        match pipeline.validate() {
            Err(ConfigError::Invalid { issues, .. }) => {
                assert_eq!(issues.len(), 2);
                assert!(issues[0].starts_with("context_window"));
                assert!(issues[1].starts_with("training.window"));
            }
            other => panic!("expected invalid pipeline, got {other:?}"),
        }

        let mut pipeline: Pipeline = serde_yaml::from_str(minimal_yaml()).unwrap();
        pipeline.context_window = MAX_SPAN;
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip_preserves_every_field() {
        let yaml = r#"
name: cpu_anomaly
description: CPU usage on the edge fleet
enabled: true
query: avg(node_load1)
step: 1m
context_window: 1h30m
prediction_horizon: 5m
mode: anomaly_only
forecast_schedule: "*/10 * * * *"
anomaly_schedule: "*/1 * * * *"
model:
  type: remote
  endpoint: http://models:8000
  serialization_format: arrow
  parameters:
    num_samples: 20
anomaly:
  technique: z_score
  confidence_level: 0.8
  threshold: 2.5
  history_window: 12h
training:
  enabled: true
  schedule: "0 3 * * *"
  window: 14d
  endpoint: http://trainer:9000/train
output:
  write_forecast: false
  write_anomaly_score: true
  metric_prefix: oa_
"#;
        let original: Pipeline = serde_yaml::from_str(yaml).unwrap();
        assert!(original.validate().is_ok());

        let saved = serde_yaml::to_string(&original).unwrap();
        let reloaded: Pipeline = serde_yaml::from_str(&saved).unwrap();
        assert_eq!(original, reloaded);
        assert!(saved.contains("context_window: 1h30m"));
        assert!(saved.contains("window: 14d"));
    }
}
