//! Training task
//!
//! Fits the pipeline's model on the training window and stores the resulting
//! artifact on the pipeline. Later job snapshots carry it to the engine.

use openanomaly_core::domain::job::Job;
use openanomaly_core::engine::TrainRequest;
use openanomaly_core::error::TaskError;
use openanomaly_core::store::JobOutcome;
use tracing::info;

use crate::service::JobRunner;

pub(crate) async fn run(runner: &JobRunner, job: &Job) -> Result<JobOutcome, TaskError> {
    let pipeline = job.pipeline();
    let Some(training) = pipeline.training.as_ref().filter(|t| t.enabled) else {
        return Err(TaskError::ConfigValidation(format!(
            "pipeline '{}' has training disabled",
            pipeline.name
        )));
    };

    let window = job.window()?;
    let engine = runner.engines.engine_for(pipeline)?;
    let history = runner
        .fetch_context(pipeline, window.start, window.end)
        .await?;

    // Training parameters override the model's inference parameters.
    let mut parameters = pipeline.model.parameters.clone();
    parameters.extend(training.parameters.clone());

    let request = TrainRequest {
        pipeline: pipeline.name.clone(),
        step: pipeline.step,
        window_start: window.start,
        window_end: window.end,
        parameters,
    };
    let artifact = engine.train(&history, &request).await?;

    info!(
        pipeline = %pipeline.name,
        model = %artifact.model_id,
        points = history.len(),
        "model trained"
    );

    runner
        .commit_once(job, runner.record_artifact(&artifact))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::engine::BackendFactory;
    use crate::service::testing::*;
    use openanomaly_core::domain::job::JobKind;
    use openanomaly_core::domain::series::Sample;
    use openanomaly_core::store::PipelineRegistry;

    #[tokio::test]
    async fn test_trained_artifact_is_recorded() {
        let tsdb = Arc::new(StubTsdb::default());
        let history: Vec<Sample> = (0..121)
            .map(|i| {
                let value = 50.0 + 0.2 * i as f64 + (i as f64 * 0.3).sin();
                Sample::new(at(10, 0) + chrono::Duration::minutes(i), value)
            })
            .collect();
        tsdb.add_series("avg(cpu)", history);

        let factory = Arc::new(BackendFactory::new(reqwest::Client::new()));
        let fixture = Fixture::with_provider(tsdb, factory);
        let pipeline = pipeline(serde_json::json!({
            "name": "cpu",
            "query": "avg(cpu)",
            "model": { "type": "local", "id": "holt" },
            "training": { "window": "2h", "parameters": { "note": "nightly" } },
        }));
        fixture.registry.insert(&pipeline).await.unwrap();

        let mut job = job_for(&pipeline, JobKind::Train, at(12, 0));
        job.attempt = 1;
        let outcome = fixture.runner.execute(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Committed);

        let entry = fixture.registry.get("cpu").await.unwrap().unwrap();
        let artifact = entry.snapshot().unwrap().artifact.clone().unwrap();
        assert_eq!(artifact.model_id, "holt");
        assert_eq!(artifact.window_start, at(10, 0));
        assert_eq!(artifact.window_end, at(12, 0));
        assert!(artifact.parameters.contains_key("alpha"));
        assert_eq!(artifact.parameters["note"], "nightly");

        // Redelivery does not train twice into the registry.
        job.attempt = 2;
        assert_eq!(fixture.runner.execute(&job).await.unwrap(), JobOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_training_disabled_is_config_error() {
        let fixture = Fixture::new(
            Arc::new(StubTsdb::default()),
            Arc::new(StubEngine::flat(1.0, 1)),
        );
        let pipeline = forecast_pipeline("cpu");
        let job = job_for(&pipeline, JobKind::Train, at(12, 0));

        let err = fixture.runner.execute(&job).await.unwrap_err();
        assert!(matches!(err, TaskError::ConfigValidation(_)));
    }
}
