//! Anomaly task
//!
//! An anomaly tick due at `T` scores `(T, T + horizon]`: actuals against the
//! forecast previously written for those timestamps. Where several forecast
//! ticks predicted the same timestamp, the latest one made at or before `T`
//! is used. `anomaly_only`
//! pipelines have no forecast task, so their forecast is produced inline from
//! the context before `T` and never written.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::Job;
use openanomaly_core::domain::pipeline::{Pipeline, PipelineMode};
use openanomaly_core::domain::series::{Sample, WritePoint};
use openanomaly_core::error::TaskError;
use openanomaly_core::scoring::{self, AnomalyScorer, ScoreInput};
use openanomaly_core::store::JobOutcome;
use tracing::{debug, info};

use crate::service::JobRunner;
use crate::service::forecast;

/// Forecast values stored for one timestamp
#[derive(Debug, Clone, Default, PartialEq)]
struct Predicted {
    mean: Option<f64>,
    quantiles: Vec<(f64, f64)>,
}

type ForecastTimeline = BTreeMap<DateTime<Utc>, Predicted>;

pub(crate) async fn run(runner: &JobRunner, job: &Job) -> Result<JobOutcome, TaskError> {
    let pipeline = job.pipeline();
    let window = job.window()?;
    let first = window.start + pipeline.step.as_chrono();
    let scorer = AnomalyScorer::from_config(&pipeline.anomaly);

    let actuals = runner
        .fetch_series(&pipeline.query, first, window.end, pipeline.step)
        .await?;
    if actuals.is_empty() {
        return Err(TaskError::DataUnavailable(format!(
            "no actuals in ({}, {}]",
            window.start, window.end
        )));
    }

    let mut predicted = read_forecast(runner, pipeline, first, window.end, window.start).await?;
    if predicted.is_empty() {
        predicted = match pipeline.mode {
            PipelineMode::AnomalyOnly => inline_forecast(runner, job).await?,
            _ => {
                return Err(TaskError::ForecastUnavailable(format!(
                    "no forecast written for ({}, {}]",
                    window.start, window.end
                )));
            }
        };
    }

    let inputs = score_inputs(&actuals, &predicted);
    if inputs.is_empty() {
        return Err(TaskError::ForecastUnavailable(
            "no forecast at any observed timestamp".to_string(),
        ));
    }

    let history = if scorer.uses_history() {
        residual_history(runner, pipeline, window.start).await?
    } else {
        Vec::new()
    };

    let scores = scorer.score_window(&inputs, &history);
    let Some(score) = scoring::aggregate(&scores) else {
        return Err(TaskError::ForecastUnavailable("nothing to score".to_string()));
    };

    info!(
        pipeline = %pipeline.name,
        window_end = %window.end,
        points = inputs.len(),
        score = score.score,
        is_anomaly = score.is_anomaly,
        insufficient_history = score.insufficient_history,
        "window scored"
    );

    if !pipeline.output.write_anomaly_score {
        return Ok(JobOutcome::Committed);
    }

    let point = WritePoint::new(pipeline.anomaly_metric(), window.end, score.score)
        .label("pipeline", pipeline.name.as_str());
    runner
        .commit_once(job, runner.write_points(std::slice::from_ref(&point)))
        .await
}

/// Forecast written for the pipeline over `[start, end]`, as known at `as_of`
///
/// Series forecast after `as_of` are ignored. Per timestamp, the series with
/// the latest origin wins; series without an origin rank below all others.
async fn read_forecast(
    runner: &JobRunner,
    pipeline: &Pipeline,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> Result<ForecastTimeline, TaskError> {
    let selector = format!(
        "{}{{pipeline=\"{}\"}}",
        pipeline.forecast_metric(),
        pipeline.name
    );
    let series = runner
        .tsdb
        .query_range(&selector, start, end, pipeline.step)
        .await?;

    let mut by_origin: BTreeMap<Option<i64>, ForecastTimeline> = BTreeMap::new();
    for s in series {
        let origin = s
            .label(forecast::ORIGIN_LABEL)
            .and_then(|o| o.parse::<i64>().ok());
        if origin.is_some_and(|o| o > as_of.timestamp()) {
            continue;
        }
        let quantile = s.label("quantile").and_then(|q| q.parse::<f64>().ok());
        let is_mean = s.label("type") == Some("mean");
        let timeline = by_origin.entry(origin).or_default();
        for sample in s.samples {
            let entry = timeline.entry(sample.timestamp).or_default();
            if is_mean {
                entry.mean = Some(sample.value);
            } else if let Some(level) = quantile {
                entry.quantiles.push((level, sample.value));
            }
        }
    }

    let mut merged = ForecastTimeline::new();
    for (_, mut timeline) in by_origin {
        // Quantiles without a mean cannot be scored.
        timeline.retain(|_, p| p.mean.is_some());
        merged.extend(timeline);
    }
    debug!(pipeline = %pipeline.name, points = merged.len(), "forecast read back");
    Ok(merged)
}

async fn inline_forecast(runner: &JobRunner, job: &Job) -> Result<ForecastTimeline, TaskError> {
    let pipeline = job.pipeline();
    let origin = job.due_at;
    let engine = runner.engines.engine_for(pipeline)?;
    let context = runner
        .fetch_context(
            pipeline,
            origin - pipeline.context_window.as_chrono(),
            origin,
        )
        .await?;

    let output = forecast::predict(
        engine.as_ref(),
        pipeline,
        job.snapshot.artifact.as_ref(),
        &context,
    )
    .await?;

    Ok(output
        .mean
        .iter()
        .enumerate()
        .map(|(i, mean)| {
            (
                forecast::point_time(pipeline, origin, i),
                Predicted {
                    mean: Some(*mean),
                    quantiles: output.quantiles_at(i),
                },
            )
        })
        .collect())
}

/// Pair actuals with the forecast at the same timestamp
fn score_inputs(actuals: &[Sample], predicted: &ForecastTimeline) -> Vec<ScoreInput> {
    actuals
        .iter()
        .filter_map(|sample| {
            let p = predicted.get(&sample.timestamp)?;
            Some(ScoreInput {
                actual: sample.value,
                predicted: p.mean?,
                quantiles: p.quantiles.clone(),
            })
        })
        .collect()
}

/// Residuals `forecast - actual` over `[origin - history_window, origin]`
async fn residual_history(
    runner: &JobRunner,
    pipeline: &Pipeline,
    origin: DateTime<Utc>,
) -> Result<Vec<f64>, TaskError> {
    let start = origin - pipeline.anomaly.history_window.as_chrono();
    let predicted = read_forecast(runner, pipeline, start, origin, origin).await?;
    if predicted.is_empty() {
        return Ok(Vec::new());
    }
    let actuals = runner
        .fetch_series(&pipeline.query, start, origin, pipeline.step)
        .await?;

    Ok(score_inputs(&actuals, &predicted)
        .iter()
        .map(|p| scoring::residual(p.predicted, p.actual))
        .collect())
}
