//! Task runtime
//!
//! Runs one delivered job end to end: the task body within its wall-clock
//! budget, result commits through the ledger, and settling the job with the
//! queue according to how the task ended.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::{Job, JobKind};
use openanomaly_core::domain::pipeline::Pipeline;
use openanomaly_core::domain::result::TrainingArtifact;
use openanomaly_core::domain::series::{Sample, WritePoint};
use openanomaly_core::duration::PromDuration;
use openanomaly_core::error::{Disposition, ErrorClass, StoreError, TaskError};
use openanomaly_core::store::{ArtifactRecorder, ClaimOutcome, JobOutcome, JobSource, ResultLedger};
use openanomaly_core::tsdb::TsdbClient;
use tracing::{debug, info, warn};

use crate::engine::EngineProvider;
use crate::service::{anomaly, forecast, train};

/// Limits applied to every task execution
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Wall-clock budget of one execution
    pub task_timeout: Duration,
    /// Extra attempts for a failed result write
    pub write_retries: u32,
    /// First backoff delay between write attempts; doubles each retry
    pub write_backoff: Duration,
    /// Share of the expected points a read must return
    pub min_context_fraction: f64,
    /// Age after which another delivery's uncommitted claim is taken over
    pub claim_stale_after: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(90),
            write_retries: 3,
            write_backoff: Duration::from_millis(200),
            min_context_fraction: 0.5,
            claim_stale_after: Duration::from_secs(120),
        }
    }
}

/// Executes jobs against the TSDB, the model engines and the result ledger
pub struct JobRunner {
    pub(crate) tsdb: Arc<dyn TsdbClient>,
    pub(crate) ledger: Arc<dyn ResultLedger>,
    pub(crate) artifacts: Arc<dyn ArtifactRecorder>,
    pub(crate) engines: Arc<dyn EngineProvider>,
    pub(crate) settings: TaskSettings,
}

impl JobRunner {
    pub fn new(
        tsdb: Arc<dyn TsdbClient>,
        ledger: Arc<dyn ResultLedger>,
        artifacts: Arc<dyn ArtifactRecorder>,
        engines: Arc<dyn EngineProvider>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            tsdb,
            ledger,
            artifacts,
            engines,
            settings,
        }
    }

    /// Execute a job and settle it with the queue
    ///
    /// Only the failure classification, pipeline and window are reported;
    /// the underlying error text is kept at debug level.
    pub async fn process(&self, job: Job, queue: &dyn JobSource) -> Result<(), StoreError> {
        let pipeline = job.pipeline().name.as_str();
        let window = match job.window() {
            Ok(window) => window,
            Err(e) => {
                warn!(job_id = %job.id, pipeline, kind = %job.kind, error = %e, "job window out of range");
                let settled = queue
                    .fail(job.id, job.attempt, ErrorClass::ConfigValidation, false)
                    .await;
                return superseded_ok(&job, settled);
            }
        };

        match self.execute(&job).await {
            Ok(outcome) => {
                info!(
                    job_id = %job.id,
                    pipeline,
                    kind = %job.kind,
                    window_start = %window.start,
                    window_end = %window.end,
                    attempt = job.attempt,
                    outcome = ?outcome,
                    "task finished"
                );
                let settled = queue.complete(job.id, job.attempt, outcome).await;
                superseded_ok(&job, settled)
            }
            Err(e) => {
                let class = e.class();
                let disposition = e.disposition(job.attempt, job.max_attempts);
                warn!(
                    job_id = %job.id,
                    pipeline,
                    kind = %job.kind,
                    window_start = %window.start,
                    window_end = %window.end,
                    attempt = job.attempt,
                    error_class = %class,
                    disposition = ?disposition,
                    "task failed"
                );
                debug!(job_id = %job.id, error = %e, "task error detail");

                let settled = match disposition {
                    Disposition::Skip => {
                        queue
                            .complete(job.id, job.attempt, JobOutcome::Skipped { class })
                            .await
                    }
                    Disposition::Requeue => queue.fail(job.id, job.attempt, class, true).await,
                    Disposition::Fail | Disposition::Lost => {
                        queue.fail(job.id, job.attempt, class, false).await
                    }
                };
                superseded_ok(&job, settled)
            }
        }
    }

    /// Run the task body for a job within the time budget
    pub async fn execute(&self, job: &Job) -> Result<JobOutcome, TaskError> {
        let budget = self.settings.task_timeout;
        match tokio::time::timeout(budget, self.run_task(job)).await {
            Ok(result) => result,
            Err(_) => {
                // A write may have been cut off between claim and commit.
                if let Err(e) = self
                    .ledger
                    .release(&job.idempotency_key, &job.claim_token())
                    .await
                {
                    debug!(job_id = %job.id, error = %e, "could not release claim after timeout");
                }
                Err(TaskError::Timeout(budget))
            }
        }
    }

    async fn run_task(&self, job: &Job) -> Result<JobOutcome, TaskError> {
        match job.kind {
            JobKind::Forecast => forecast::run(self, job).await,
            JobKind::Anomaly => anomaly::run(self, job).await,
            JobKind::Train => train::run(self, job).await,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Samples of the first series `query` returns over `[start, end]`
    pub(crate) async fn fetch_series(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: PromDuration,
    ) -> Result<Vec<Sample>, TaskError> {
        let mut series = self.tsdb.query_range(query, start, end, step).await?;
        if series.len() > 1 {
            debug!(query, series = series.len(), "query returned several series; using the first");
        }
        Ok(series
            .drain(..)
            .find(|s| !s.samples.is_empty())
            .map(|s| s.samples)
            .unwrap_or_default())
    }

    /// Read `[start, end]` of the pipeline query, requiring enough points
    pub(crate) async fn fetch_context(
        &self,
        pipeline: &Pipeline,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, TaskError> {
        let samples = self
            .fetch_series(&pipeline.query, start, end, pipeline.step)
            .await?;
        let span = PromDuration::from((end - start).to_std().unwrap_or_default());
        self.require_points(samples.len(), span.steps_of(pipeline.step) as usize)?;
        Ok(samples)
    }

    fn require_points(&self, got: usize, expected: usize) -> Result<(), TaskError> {
        let min = min_points(expected, self.settings.min_context_fraction);
        if got < min {
            return Err(TaskError::DataUnavailable(format!(
                "{got} of {expected} expected points, need at least {min}"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Run `write` at most once per idempotency key
    ///
    /// The ledger decides whether this delivery may write. A key already
    /// committed by an earlier delivery is acknowledged as a duplicate without
    /// writing again; a failed write drops the claim so a redelivery can retry.
    pub(crate) async fn commit_once<F>(&self, job: &Job, write: F) -> Result<JobOutcome, TaskError>
    where
        F: Future<Output = Result<(), TaskError>>,
    {
        let key = &job.idempotency_key;
        let token = job.claim_token();

        match self
            .ledger
            .claim(key, &token, self.settings.claim_stale_after)
            .await
            .map_err(ledger_error)?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyCommitted => {
                debug!(job_id = %job.id, key = %key, "result already committed");
                return Ok(JobOutcome::Duplicate);
            }
            ClaimOutcome::Contended => return Err(TaskError::Contended),
        }

        if let Err(e) = write.await {
            if let Err(release) = self.ledger.release(key, &token).await {
                debug!(job_id = %job.id, error = %release, "could not release claim");
            }
            return Err(e);
        }

        self.ledger.commit(key, &token).await.map_err(ledger_error)?;
        Ok(JobOutcome::Committed)
    }

    /// Write points to the TSDB, retrying with backoff
    pub(crate) async fn write_points(&self, points: &[WritePoint]) -> Result<(), TaskError> {
        let tsdb = self.tsdb.as_ref();
        self.with_write_retries("tsdb write", move || tsdb.write(points))
            .await
    }

    /// Store a training artifact in the registry, retrying with backoff
    pub(crate) async fn record_artifact(&self, artifact: &TrainingArtifact) -> Result<(), TaskError> {
        let recorder = self.artifacts.as_ref();
        self.with_write_retries("artifact write", move || {
            let artifact = artifact.clone();
            async move {
                recorder
                    .record_artifact(artifact)
                    .await
                    .map_err(|e| TaskError::Transport(e.to_string()))
            }
        })
        .await
    }

    async fn with_write_retries<F, Fut>(&self, what: &str, mut op: F) -> Result<(), TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        let attempts = self.settings.write_retries + 1;
        let mut delay = self.settings.write_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    return Err(TaskError::Write {
                        attempts,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "{what} failed; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// `ceil(expected * fraction)`, never below two points
pub(crate) fn min_points(expected: usize, fraction: f64) -> usize {
    ((expected as f64 * fraction).ceil() as usize).max(2)
}

fn ledger_error(err: StoreError) -> TaskError {
    TaskError::Transport(format!("result ledger: {err}"))
}

/// A settle refused because a redelivery now holds the job is not an error
fn superseded_ok(job: &Job, settled: Result<(), StoreError>) -> Result<(), StoreError> {
    match settled {
        Err(StoreError::Conflict(reason)) => {
            debug!(job_id = %job.id, attempt = job.attempt, %reason, "delivery superseded");
            Ok(())
        }
        other => other,
    }
}
