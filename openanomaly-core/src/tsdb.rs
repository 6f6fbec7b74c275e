//! TSDB port

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::series::{Series, WritePoint};
use crate::duration::PromDuration;
use crate::error::TaskError;

/// Read/write access to a Prometheus-compatible TSDB.
#[async_trait]
pub trait TsdbClient: Send + Sync {
    /// Evaluates `query` over `[start, end]` at `step` resolution
    ///
    /// Transport failures surface as [`TaskError::Transport`]; an empty result
    /// is not an error.
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: PromDuration,
    ) -> Result<Vec<Series>, TaskError>;

    /// Writes points in a single request. Either all are accepted or the
    /// call fails.
    async fn write(&self, points: &[WritePoint]) -> Result<(), TaskError>;
}
