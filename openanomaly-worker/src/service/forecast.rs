//! Forecast task
//!
//! Reads the context window ending at the tick, asks the pipeline's engine for
//! `horizon / step` points and writes the mean plus every quantile series.
//! Every series carries the tick it was forecast from in an `origin` label,
//! so overlapping horizons of consecutive ticks never overwrite each other.

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::Job;
use openanomaly_core::domain::pipeline::{DEFAULT_QUANTILES, Pipeline};
use openanomaly_core::domain::result::{Forecast, TrainingArtifact, quantile_label};
use openanomaly_core::domain::series::{Sample, WritePoint};
use openanomaly_core::engine::{ForecastRequest, ModelEngine};
use openanomaly_core::error::TaskError;
use openanomaly_core::scoring::AnomalyScorer;
use openanomaly_core::store::JobOutcome;
use tracing::info;

use crate::service::JobRunner;

/// Label holding the unix second of the tick a forecast was made at
pub(crate) const ORIGIN_LABEL: &str = "origin";

pub(crate) async fn run(runner: &JobRunner, job: &Job) -> Result<JobOutcome, TaskError> {
    let pipeline = job.pipeline();
    let window = job.window()?;

    let engine = runner.engines.engine_for(pipeline)?;
    let context = runner
        .fetch_context(pipeline, window.start, window.end)
        .await?;
    let forecast = predict(
        engine.as_ref(),
        pipeline,
        job.snapshot.artifact.as_ref(),
        &context,
    )
    .await?;

    if !pipeline.output.write_forecast {
        info!(pipeline = %pipeline.name, "forecast computed; writes disabled");
        return Ok(JobOutcome::Committed);
    }

    let points = forecast_points(pipeline, window.end, &forecast);
    runner
        .commit_once(job, runner.write_points(&points))
        .await
}

/// Quantile levels requested from the engine
///
/// The default set, plus whatever the pipeline's anomaly technique needs.
pub(crate) fn request_quantiles(pipeline: &Pipeline) -> Vec<f64> {
    let mut levels = DEFAULT_QUANTILES.to_vec();
    if pipeline.mode.scores_anomalies() {
        levels.extend(AnomalyScorer::from_config(&pipeline.anomaly).required_quantiles());
    }
    levels.sort_by(f64::total_cmp);
    levels.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    levels
}

pub(crate) async fn predict(
    engine: &dyn ModelEngine,
    pipeline: &Pipeline,
    artifact: Option<&TrainingArtifact>,
    context: &[Sample],
) -> Result<Forecast, TaskError> {
    let request = ForecastRequest {
        prediction_length: pipeline.prediction_length(),
        step: pipeline.step,
        quantiles: request_quantiles(pipeline),
        parameters: pipeline.model.parameters.clone(),
        artifact: artifact.cloned(),
    };

    let forecast = engine.predict(context, &request).await?;
    forecast
        .check_shape(request.prediction_length)
        .map_err(|e| TaskError::Inference(format!("{}: {e}", engine.name())))?;
    Ok(forecast)
}

/// Timestamp of the `index`-th (0-based) predicted point
pub(crate) fn point_time(pipeline: &Pipeline, anchor: DateTime<Utc>, index: usize) -> DateTime<Utc> {
    anchor + pipeline.step.as_chrono() * (index as i32 + 1)
}

fn forecast_points(pipeline: &Pipeline, anchor: DateTime<Utc>, forecast: &Forecast) -> Vec<WritePoint> {
    let metric = pipeline.forecast_metric();
    let origin = anchor.timestamp().to_string();
    let mut points = Vec::with_capacity(forecast.len() * (forecast.quantiles.len() + 1));

    for (i, mean) in forecast.mean.iter().enumerate() {
        let timestamp = point_time(pipeline, anchor, i);
        points.push(
            WritePoint::new(metric.as_str(), timestamp, *mean)
                .label("pipeline", pipeline.name.as_str())
                .label(ORIGIN_LABEL, origin.as_str())
                .label("type", "mean"),
        );
        for (level, value) in forecast.quantiles_at(i) {
            points.push(
                WritePoint::new(metric.as_str(), timestamp, value)
                    .label("pipeline", pipeline.name.as_str())
                    .label(ORIGIN_LABEL, origin.as_str())
                    .label("quantile", quantile_label(level)),
            );
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::service::testing::*;
    use openanomaly_core::domain::job::{JobKind, JobStatus};
    use openanomaly_core::error::ErrorClass;
    use openanomaly_core::memory::MemoryJobQueue;
    use openanomaly_core::store::{JobQueue, JobSource};

    fn fixture(samples: usize) -> (Fixture, Arc<StubTsdb>) {
        let tsdb = Arc::new(StubTsdb::default());
        tsdb.add_series("avg(cpu)", flat_samples(at(11, 0), samples, 10.0));
        let fixture = Fixture::new(tsdb.clone(), Arc::new(StubEngine::flat(10.0, 5)));
        (fixture, tsdb)
    }

    #[tokio::test]
    async fn test_writes_mean_and_quantiles_after_the_tick() {
        let (fixture, tsdb) = fixture(61);
        let mut job = job_for(&forecast_pipeline("cpu"), JobKind::Forecast, at(12, 0));
        job.attempt = 1;

        let outcome = fixture.runner.execute(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Committed);

        let written = tsdb.written();
        // 5 steps x (mean + 2 quantiles)
        assert_eq!(written.len(), 15);
        assert!(written.iter().all(|p| p.metric == "openanomaly_forecast"));
        assert!(written.iter().all(|p| p.labels["pipeline"] == "cpu"));
        let origin = at(12, 0).timestamp().to_string();
        assert!(written.iter().all(|p| p.labels[ORIGIN_LABEL] == origin));

        let means: Vec<_> = written
            .iter()
            .filter(|p| p.labels.get("type").map(String::as_str) == Some("mean"))
            .map(|p| p.timestamp)
            .collect();
        assert_eq!(means, (1..=5).map(|m| at(12, m)).collect::<Vec<_>>());

        let upper: Vec<_> = written
            .iter()
            .filter(|p| p.labels.get("quantile").map(String::as_str) == Some("0.975"))
            .collect();
        assert_eq!(upper.len(), 5);
        assert_eq!(upper[0].value, 12.0);
        assert!(fixture.ledger.is_committed(&job.idempotency_key).await);
    }

    #[tokio::test]
    async fn test_redelivery_writes_once() {
        let (fixture, tsdb) = fixture(61);
        let job = job_for(&forecast_pipeline("cpu"), JobKind::Forecast, at(12, 0));

        let mut outcomes = Vec::new();
        for attempt in 1..=3 {
            let mut delivery = job.clone();
            delivery.attempt = attempt;
            outcomes.push(fixture.runner.execute(&delivery).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![JobOutcome::Committed, JobOutcome::Duplicate, JobOutcome::Duplicate]
        );
        assert_eq!(tsdb.write_calls(), 1);
        assert_eq!(tsdb.written().len(), 15);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_write_distinct_series() {
        let tsdb = Arc::new(StubTsdb::default());
        tsdb.add_series("avg(cpu)", flat_samples(at(11, 0), 61, 10.0));
        let early = Fixture::new(tsdb.clone(), Arc::new(StubEngine::flat(10.0, 5)));
        let late = Fixture::new(tsdb.clone(), Arc::new(StubEngine::flat(20.0, 5)));
        let pipeline = forecast_pipeline("cpu");

        let mut first = job_for(&pipeline, JobKind::Forecast, at(12, 0));
        first.attempt = 1;
        let mut second = job_for(&pipeline, JobKind::Forecast, at(12, 2));
        second.attempt = 1;
        assert_eq!(early.runner.execute(&first).await.unwrap(), JobOutcome::Committed);
        assert_eq!(late.runner.execute(&second).await.unwrap(), JobOutcome::Committed);

        let written = tsdb.written();
        let mut identities: Vec<_> = written
            .iter()
            .map(|p| (p.labels.clone(), p.timestamp))
            .collect();
        identities.sort();
        identities.dedup();
        assert_eq!(identities.len(), written.len());

        // 12:03 was forecast by both ticks; both values survive.
        let mut at_1203: Vec<(String, f64)> = written
            .iter()
            .filter(|p| p.timestamp == at(12, 3))
            .filter(|p| p.labels.get("type").map(String::as_str) == Some("mean"))
            .map(|p| (p.labels[ORIGIN_LABEL].clone(), p.value))
            .collect();
        at_1203.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            at_1203,
            vec![
                (at(12, 0).timestamp().to_string(), 10.0),
                (at(12, 2).timestamp().to_string(), 20.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_insufficient_context_skips_the_tick() {
        let (fixture, tsdb) = fixture(12);
        let queue = MemoryJobQueue::new(Duration::from_secs(120), 3);
        queue
            .enqueue(job_for(&forecast_pipeline("cpu"), JobKind::Forecast, at(12, 0)), None)
            .await
            .unwrap();
        let job = queue.consume("w1").await.unwrap().unwrap();
        let id = job.id;

        let err = fixture.runner.execute(&job).await.unwrap_err();
        assert!(matches!(err, TaskError::DataUnavailable(_)));

        fixture.runner.process(job, &queue).await.unwrap();
        assert_eq!(queue.status(id).await, Some(JobStatus::Skipped));
        assert_eq!(queue.last_error(id).await, Some(ErrorClass::DataUnavailable));
        assert_eq!(tsdb.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_serialization_error_is_not_retried() {
        let tsdb = Arc::new(StubTsdb::default());
        tsdb.add_series("avg(cpu)", flat_samples(at(11, 0), 61, 10.0));
        let engine = StubEngine::failing(TaskError::Serialization("not an arrow stream".into()));
        let fixture = Fixture::new(tsdb.clone(), Arc::new(engine));
        let queue = MemoryJobQueue::new(Duration::from_secs(120), 3);

        let pipeline = forecast_pipeline("cpu");
        queue
            .enqueue(job_for(&pipeline, JobKind::Forecast, at(12, 0)), None)
            .await
            .unwrap();
        queue
            .enqueue(job_for(&pipeline, JobKind::Forecast, at(12, 5)), None)
            .await
            .unwrap();

        let first = queue.consume("w1").await.unwrap().unwrap();
        let failed = first.id;
        fixture.runner.process(first, &queue).await.unwrap();
        assert_eq!(queue.status(failed).await, Some(JobStatus::Failed));
        assert_eq!(queue.last_error(failed).await, Some(ErrorClass::Serialization));

        // The next tick is delivered independently; the failed one is not.
        let next = queue.consume("w1").await.unwrap().unwrap();
        assert_ne!(next.id, failed);
        assert_eq!(next.due_at, at(12, 5));
        assert!(queue.consume("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_forecast_shape_is_inference_error() {
        let tsdb = Arc::new(StubTsdb::default());
        tsdb.add_series("avg(cpu)", flat_samples(at(11, 0), 61, 10.0));
        // Three points for a five-step horizon.
        let fixture = Fixture::new(tsdb, Arc::new(StubEngine::flat(10.0, 3)));
        let mut job = job_for(&forecast_pipeline("cpu"), JobKind::Forecast, at(12, 0));
        job.attempt = 1;

        let err = fixture.runner.execute(&job).await.unwrap_err();
        assert!(matches!(err, TaskError::Inference(_)));
        assert!(err.is_retryable());
    }

    fn pipeline_with_confidence(level: f64) -> Pipeline {
        pipeline(serde_json::json!({
            "name": "mem",
            "query": "up",
            "model": { "type": "local", "id": "holt" },
            "anomaly": { "technique": "confidence_interval", "confidence_level": level },
        }))
    }

    #[test]
    fn test_request_quantiles_cover_confidence_band() {
        let pipeline = pipeline_with_confidence(0.8);
        // The 0.8 band lands on 0.1 and 0.9, which are already requested.
        let levels = request_quantiles(&pipeline);
        assert_eq!(levels.len(), 5);
        assert!((levels[0] - 0.1).abs() < 1e-9);
        assert!((levels[2] - 0.9).abs() < 1e-9);

        let pipeline = pipeline_with_confidence(0.95);
        let levels = request_quantiles(&pipeline);
        assert_eq!(levels.len(), 7);
        assert!((levels[0] - 0.025).abs() < 1e-9);
        assert!((levels[6] - 0.99).abs() < 1e-9);

        let pipeline = forecast_pipeline("cpu");
        assert_eq!(request_quantiles(&pipeline), DEFAULT_QUANTILES.to_vec());
    }
}
