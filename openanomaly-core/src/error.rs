//! Error taxonomy shared across services
//!
//! Task errors are classified so the worker can decide, without knowing the
//! concrete failure, whether a job is skipped, retried, failed or lost.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline definition errors, raised at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to parse pipeline definition: {0}")]
    Parse(String),

    #[error("pipeline '{pipeline}' is invalid: {}", issues.join("; "))]
    Invalid { pipeline: String, issues: Vec<String> },
}

impl ConfigError {
    pub fn invalid(pipeline: impl Into<String>, issue: impl Into<String>) -> Self {
        Self::Invalid {
            pipeline: pipeline.into(),
            issues: vec![issue.into()],
        }
    }
}

/// Errors raised by storage backends (registry, lease, queue, ledger).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Classification of task failures, as reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ConfigValidation,
    DataUnavailable,
    ForecastUnavailable,
    Inference,
    Serialization,
    Transport,
    Write,
    Contended,
    Timeout,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ConfigValidation => "config_validation",
            ErrorClass::DataUnavailable => "data_unavailable",
            ErrorClass::ForecastUnavailable => "forecast_unavailable",
            ErrorClass::Inference => "inference",
            ErrorClass::Serialization => "serialization",
            ErrorClass::Transport => "transport",
            ErrorClass::Write => "write",
            ErrorClass::Contended => "contended",
            ErrorClass::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config_validation" => Ok(ErrorClass::ConfigValidation),
            "data_unavailable" => Ok(ErrorClass::DataUnavailable),
            "forecast_unavailable" => Ok(ErrorClass::ForecastUnavailable),
            "inference" => Ok(ErrorClass::Inference),
            "serialization" => Ok(ErrorClass::Serialization),
            "transport" => Ok(ErrorClass::Transport),
            "write" => Ok(ErrorClass::Write),
            "contended" => Ok(ErrorClass::Contended),
            "timeout" => Ok(ErrorClass::Timeout),
            other => Err(format!("unknown error class '{other}'")),
        }
    }
}

/// Failure of a single task execution.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("insufficient data: {0}")]
    DataUnavailable(String),

    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("write failed after {attempts} attempts: {message}")]
    Write { attempts: u32, message: String },

    #[error("result for this window is being written by another delivery")]
    Contended,

    #[error("task exceeded its time budget of {0:?}")]
    Timeout(std::time::Duration),
}

/// What the worker does with a job after a task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge without a result; the tick simply produced nothing.
    Skip,
    /// Hand the job back to the queue for another attempt.
    Requeue,
    /// Terminal failure. Later ticks are unaffected.
    Fail,
    /// The computed result could not be persisted. The tick is lost.
    Lost,
}

impl From<ConfigError> for TaskError {
    fn from(err: ConfigError) -> Self {
        TaskError::ConfigValidation(err.to_string())
    }
}

impl TaskError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::ConfigValidation(_) => ErrorClass::ConfigValidation,
            TaskError::DataUnavailable(_) => ErrorClass::DataUnavailable,
            TaskError::ForecastUnavailable(_) => ErrorClass::ForecastUnavailable,
            TaskError::Inference(_) => ErrorClass::Inference,
            TaskError::Serialization(_) => ErrorClass::Serialization,
            TaskError::Transport(_) => ErrorClass::Transport,
            TaskError::Write { .. } => ErrorClass::Write,
            TaskError::Contended => ErrorClass::Contended,
            TaskError::Timeout(_) => ErrorClass::Timeout,
        }
    }

    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Inference(_)
                | TaskError::Transport(_)
                | TaskError::Contended
                | TaskError::Timeout(_)
        )
    }

    /// Decide the job's fate given the attempt just made (1-based).
    pub fn disposition(&self, attempt: u32, max_attempts: u32) -> Disposition {
        match self {
            TaskError::DataUnavailable(_) | TaskError::ForecastUnavailable(_) => Disposition::Skip,
            TaskError::Write { .. } => Disposition::Lost,
            _ if self.is_retryable() && attempt < max_attempts => Disposition::Requeue,
            _ => Disposition::Fail,
        }
    }
}
