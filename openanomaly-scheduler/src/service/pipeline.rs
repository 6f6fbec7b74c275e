//! Pipeline Service
//!
//! Registry seeding and manual triggers.

use std::path::Path;

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::{Job, JobKind, ScheduleTick};
use openanomaly_core::dto::job::TriggerResponse;
use openanomaly_core::error::{ConfigError, StoreError};
use openanomaly_core::schema;
use openanomaly_core::store::{JobQueue, PipelineRegistry};

/// Service error type
#[derive(Debug)]
pub enum PipelineError {
    NotFound(String),
    Invalid(ConfigError),
    NotRunnable(String),
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}

/// Outcome of seeding the registry from a document
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub stored: usize,
    pub rejected: Vec<String>,
}

/// Upsert every pipeline of a YAML or JSON document into the registry
///
/// Each entry is upserted on its own; invalid ones are stored as rejected
/// and reported so they stay visible without being scheduled.
pub async fn seed_from_file(
    registry: &dyn PipelineRegistry,
    path: &Path,
) -> anyhow::Result<SeedReport> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    seed_from_str(registry, &source).await
}

pub async fn seed_from_str(
    registry: &dyn PipelineRegistry,
    source: &str,
) -> anyhow::Result<SeedReport> {
    let raw: serde_yaml::Value = serde_yaml::from_str(source)?;
    // Structural problems with the document as a whole fail the seed.
    let entries = schema::parse_document(source)?;
    let definitions = raw
        .get("pipelines")
        .and_then(|p| p.as_sequence())
        .cloned()
        .unwrap_or_default();

    let mut report = SeedReport::default();
    for (entry, definition) in entries.into_iter().zip(definitions) {
        if let Err(e) = &entry.result {
            tracing::warn!(pipeline = %entry.name, error = %e, "pipeline definition rejected");
            report.rejected.push(entry.name.clone());
        }

        let definition = serde_json::to_value(&definition)?;
        match registry.upsert(definition).await {
            Ok(_) => report.stored += 1,
            Err(e) => tracing::warn!(pipeline = %entry.name, error = %e, "pipeline not stored"),
        }
    }

    tracing::info!(
        stored = report.stored,
        rejected = report.rejected.len(),
        "pipeline registry seeded"
    );
    Ok(report)
}

/// Enqueue an out-of-schedule job for a pipeline
///
/// The window is anchored at `now` truncated to the pipeline step. Anomaly
/// triggers score the most recent complete horizon so they run right away.
/// Manual jobs carry no fencing token but share the idempotency key of the
/// scheduled tick for the same window.
pub async fn trigger(
    registry: &dyn PipelineRegistry,
    queue: &dyn JobQueue,
    name: &str,
    kind: JobKind,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<TriggerResponse, PipelineError> {
    let entry = registry
        .get(name)
        .await?
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
    let snapshot = entry.definition.map_err(PipelineError::Invalid)?;
    let pipeline = &snapshot.pipeline;

    if !pipeline.enabled {
        return Err(PipelineError::NotRunnable(format!("pipeline '{name}' is disabled")));
    }
    if pipeline.schedule_for(kind).is_none() {
        return Err(PipelineError::NotRunnable(format!(
            "pipeline '{name}' does not run {kind} jobs in mode {}",
            pipeline.mode
        )));
    }

    let anchor = truncate_to_step(now, pipeline.step.as_millis());
    let due_at = match kind {
        JobKind::Anomaly => anchor
            .checked_sub_signed(pipeline.prediction_horizon.as_chrono())
            .ok_or_else(|| {
                PipelineError::Invalid(ConfigError::invalid(
                    name,
                    "prediction_horizon reaches before the representable range",
                ))
            })?,
        JobKind::Forecast | JobKind::Train => anchor,
    };
    let tick = ScheduleTick {
        pipeline: name.to_string(),
        kind,
        due_at,
    };

    let job = Job::for_tick(&tick, snapshot, max_attempts, now).map_err(PipelineError::Invalid)?;
    let response = TriggerResponse {
        job_id: job.id,
        pipeline: name.to_string(),
        kind,
        due_at: job.due_at,
        not_before: job.not_before,
        idempotency_key: job.idempotency_key.clone(),
        outcome: queue.enqueue(job, None).await?,
    };

    tracing::info!(
        pipeline = %name,
        kind = %kind,
        due_at = %response.due_at,
        outcome = ?response.outcome,
        "manual trigger"
    );
    Ok(response)
}

fn truncate_to_step(t: DateTime<Utc>, step_millis: u64) -> DateTime<Utc> {
    if step_millis == 0 {
        return t;
    }
    let millis = t.timestamp_millis();
    let truncated = millis - millis.rem_euclid(step_millis as i64);
    DateTime::from_timestamp_millis(truncated).unwrap_or(t)
}
