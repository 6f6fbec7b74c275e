//! Job domain types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::pipeline::Pipeline;
use crate::domain::result::TrainingArtifact;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Forecast,
    Anomaly,
    Train,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Forecast, JobKind::Anomaly, JobKind::Train];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Forecast => "forecast",
            JobKind::Anomaly => "anomaly",
            JobKind::Train => "train",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forecast" => Ok(JobKind::Forecast),
            "anomaly" => Ok(JobKind::Anomaly),
            "train" => Ok(JobKind::Train),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Skipped,
    Failed,
    Lost,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
            JobStatus::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "skipped" => Ok(JobStatus::Skipped),
            "failed" => Ok(JobStatus::Failed),
            "lost" => Ok(JobStatus::Lost),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A schedule tick that came due for one pipeline and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTick {
    pub pipeline: String,
    pub kind: JobKind,
    pub due_at: DateTime<Utc>,
}

/// Deterministic key identifying the result of one (pipeline, kind, window).
///
/// Redelivered and duplicated jobs share it, which is what lets the queue and
/// the result ledger suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(pipeline: &str, kind: JobKind, window_start: DateTime<Utc>) -> Self {
        let material = format!("{pipeline}|{kind}|{}", window_start.timestamp());
        Self(hex::encode(Sha256::digest(material.as_bytes())))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline definition plus registry-owned state, frozen at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub pipeline: Pipeline,
    #[serde(default)]
    pub artifact: Option<TrainingArtifact>,
}

/// Time range a job reads or scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub due_at: DateTime<Utc>,
    /// Earliest time a worker may pick the job up.
    pub not_before: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    /// 1-based number of the delivery currently holding the job.
    pub attempt: u32,
    pub max_attempts: u32,
    pub snapshot: PipelineSnapshot,
}

impl Job {
    /// Build the job for a due tick.
    ///
    /// Anomaly jobs score the horizon after the tick, so they only become
    /// visible once that horizon has elapsed.
    pub fn for_tick(
        tick: &ScheduleTick,
        snapshot: PipelineSnapshot,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let window = window_for(&snapshot.pipeline, tick.kind, tick.due_at)?;
        let not_before = match tick.kind {
            JobKind::Anomaly => window.end,
            JobKind::Forecast | JobKind::Train => tick.due_at,
        };
        Ok(Self {
            id: Uuid::new_v4(),
            kind: tick.kind,
            due_at: tick.due_at,
            not_before,
            enqueued_at: now,
            idempotency_key: IdempotencyKey::derive(&tick.pipeline, tick.kind, window.start),
            attempt: 0,
            max_attempts,
            snapshot,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.snapshot.pipeline
    }

    pub fn window(&self) -> Result<JobWindow, ConfigError> {
        window_for(&self.snapshot.pipeline, self.kind, self.due_at)
    }

    /// Token identifying this particular delivery to the result ledger.
    pub fn claim_token(&self) -> String {
        format!("{}:{}", self.id, self.attempt)
    }
}

/// Window read or scored by a job of `kind` due at `due_at`.
///
/// - forecast: context `[due - context_window, due]`, predicting after `due`
/// - anomaly: scores `(due, due + prediction_horizon]`
/// - train: `[due - training.window, due]`
pub fn window_for(
    pipeline: &Pipeline,
    kind: JobKind,
    due_at: DateTime<Utc>,
) -> Result<JobWindow, ConfigError> {
    let (start, end) = match kind {
        JobKind::Forecast => (
            due_at.checked_sub_signed(pipeline.context_window.as_chrono()),
            Some(due_at),
        ),
        JobKind::Anomaly => (
            Some(due_at),
            due_at.checked_add_signed(pipeline.prediction_horizon.as_chrono()),
        ),
        JobKind::Train => {
            let span = pipeline
                .training
                .as_ref()
                .map(|t| t.window)
                .unwrap_or(pipeline.context_window);
            (due_at.checked_sub_signed(span.as_chrono()), Some(due_at))
        }
    };
    match (start, end) {
        (Some(start), Some(end)) => Ok(JobWindow { start, end }),
        _ => Err(ConfigError::invalid(
            &pipeline.name,
            format!("{kind} window for tick at {due_at} is out of range"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::PromDuration;
    use chrono::TimeZone;

    fn pipeline() -> Pipeline {
        serde_yaml::from_str(
            r#"
name: cpu_anomaly
query: avg(node_load1)
step: 1m
context_window: 1h
prediction_horizon: 5m
model:
  type: local
  id: holt
training:
  window: 7d
"#,
        )
        .unwrap()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn tick(kind: JobKind) -> ScheduleTick {
        ScheduleTick {
            pipeline: "cpu_anomaly".into(),
            kind,
            due_at: noon(),
        }
    }

    fn snapshot() -> PipelineSnapshot {
        PipelineSnapshot {
            pipeline: pipeline(),
            artifact: None,
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = IdempotencyKey::derive("cpu", JobKind::Forecast, noon());
        let b = IdempotencyKey::derive("cpu", JobKind::Forecast, noon());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other_kind = IdempotencyKey::derive("cpu", JobKind::Anomaly, noon());
        let other_window =
            IdempotencyKey::derive("cpu", JobKind::Forecast, noon() + chrono::Duration::minutes(5));
        assert_ne!(a, other_kind);
        assert_ne!(a, other_window);
    }

    #[test]
    fn test_forecast_window_covers_context() {
        let job = Job::for_tick(&tick(JobKind::Forecast), snapshot(), 3, noon()).unwrap();
        let window = job.window().unwrap();
        assert_eq!(window.start, noon() - chrono::Duration::hours(1));
        assert_eq!(window.end, noon());
        assert_eq!(job.not_before, noon());
    }

    #[test]
    fn test_anomaly_job_waits_for_horizon() {
        let job = Job::for_tick(&tick(JobKind::Anomaly), snapshot(), 3, noon()).unwrap();
        let window = job.window().unwrap();
        assert_eq!(window.start, noon());
        assert_eq!(window.end, noon() + chrono::Duration::minutes(5));
        assert_eq!(job.not_before, window.end);
    }

    #[test]
    fn test_train_window_uses_training_span() {
        let job = Job::for_tick(&tick(JobKind::Train), snapshot(), 3, noon()).unwrap();
        assert_eq!(job.window().unwrap().start, noon() - chrono::Duration::days(7));
    }

    #[test]
    fn test_same_tick_yields_same_key() {
        let a = Job::for_tick(&tick(JobKind::Forecast), snapshot(), 3, noon()).unwrap();
        let b = Job::for_tick(&tick(JobKind::Forecast), snapshot(), 3, noon()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_out_of_range_window_is_an_error() {
        let mut pipeline = pipeline();
        pipeline.context_window = PromDuration::from_secs(20_000_000 * 7 * 24 * 3600);
        let snapshot = PipelineSnapshot {
            pipeline,
            artifact: None,
        };
        let err = Job::for_tick(&tick(JobKind::Forecast), snapshot, 3, noon()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("cpu_anomaly"));
    }
}
