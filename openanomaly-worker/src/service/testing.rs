//! Stub collaborators shared by the task tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use openanomaly_core::domain::job::{Job, JobKind, PipelineSnapshot, ScheduleTick};
use openanomaly_core::domain::pipeline::Pipeline;
use openanomaly_core::domain::result::{Forecast, QuantileSeries, TrainingArtifact};
use openanomaly_core::domain::series::{Sample, Series, WritePoint};
use openanomaly_core::duration::PromDuration;
use openanomaly_core::engine::{ForecastRequest, ModelEngine, TrainRequest};
use openanomaly_core::error::TaskError;
use openanomaly_core::memory::{MemoryRegistry, MemoryResultLedger};
use openanomaly_core::schema;
use openanomaly_core::tsdb::TsdbClient;

use crate::engine::EngineProvider;
use crate::service::{JobRunner, TaskSettings};

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

pub fn flat_samples(start: DateTime<Utc>, n: usize, value: f64) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(start + chrono::Duration::minutes(i as i64), value))
        .collect()
}

pub fn pipeline(definition: serde_json::Value) -> Pipeline {
    schema::load_pipeline_json(&definition).unwrap()
}

/// 1h context at 1m steps, 5m horizon
pub fn forecast_pipeline(name: &str) -> Pipeline {
    pipeline(serde_json::json!({
        "name": name,
        "query": "avg(cpu)",
        "context_window": "1h",
        "prediction_horizon": "5m",
        "mode": "forecast_only",
        "model": { "type": "local", "id": "seasonal_naive" },
    }))
}

pub fn job_for(pipeline: &Pipeline, kind: JobKind, due_at: DateTime<Utc>) -> Job {
    let tick = ScheduleTick {
        pipeline: pipeline.name.clone(),
        kind,
        due_at,
    };
    let snapshot = PipelineSnapshot {
        pipeline: pipeline.clone(),
        artifact: None,
    };
    Job::for_tick(&tick, snapshot, 3, due_at).unwrap()
}

// =============================================================================
// TSDB
// =============================================================================

/// Serves registered query results and reads back its own writes by selector
#[derive(Default)]
pub struct StubTsdb {
    series: Mutex<HashMap<String, Vec<Sample>>>,
    written: Mutex<Vec<WritePoint>>,
    write_calls: AtomicU32,
    failing_writes: AtomicU32,
}

impl StubTsdb {
    pub fn add_series(&self, query: &str, samples: Vec<Sample>) {
        let mut series = self.series.lock().unwrap();
        series.entry(query.to_string()).or_default().extend(samples);
    }

    /// Store points as if a previous task had written them
    pub fn preload(&self, points: Vec<WritePoint>) {
        self.written.lock().unwrap().extend(points);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> u32 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<WritePoint> {
        self.written.lock().unwrap().clone()
    }

    /// `metric{pipeline="name"}` selectors over written points
    fn select_written(&self, query: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Series> {
        let metric = query.split('{').next().unwrap_or_default();
        let pipeline = query
            .split("pipeline=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next());

        let mut grouped: BTreeMap<BTreeMap<String, String>, Vec<Sample>> = BTreeMap::new();
        for point in self.written.lock().unwrap().iter() {
            let matches_pipeline =
                pipeline.is_none_or(|p| point.labels.get("pipeline").map(String::as_str) == Some(p));
            if point.metric == metric
                && matches_pipeline
                && point.timestamp >= start
                && point.timestamp <= end
            {
                grouped
                    .entry(point.labels.clone())
                    .or_default()
                    .push(Sample::new(point.timestamp, point.value));
            }
        }

        grouped
            .into_iter()
            .map(|(labels, mut samples)| {
                samples.sort_by_key(|s| s.timestamp);
                Series { labels, samples }
            })
            .collect()
    }
}

#[async_trait]
impl TsdbClient for StubTsdb {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step: PromDuration,
    ) -> Result<Vec<Series>, TaskError> {
        let registered = self.series.lock().unwrap().get(query).cloned();
        match registered {
            Some(samples) => Ok(vec![Series {
                labels: BTreeMap::new(),
                samples: samples
                    .into_iter()
                    .filter(|s| s.timestamp >= start && s.timestamp <= end)
                    .collect(),
            }]),
            None => Ok(self.select_written(query, start, end)),
        }
    }

    async fn write(&self, points: &[WritePoint]) -> Result<(), TaskError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(TaskError::Transport("connection refused".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

// =============================================================================
// Model engine
// =============================================================================

pub struct StubEngine {
    forecast: Forecast,
    delay: Option<Duration>,
    error: Option<TaskError>,
    predict_calls: AtomicU32,
}

impl StubEngine {
    /// Constant forecast with a 0.025/0.975 band of +-2
    pub fn flat(value: f64, len: usize) -> Self {
        Self {
            forecast: Forecast {
                mean: vec![value; len],
                quantiles: vec![
                    QuantileSeries {
                        level: 0.025,
                        values: vec![value - 2.0; len],
                    },
                    QuantileSeries {
                        level: 0.975,
                        values: vec![value + 2.0; len],
                    },
                ],
            },
            delay: None,
            error: None,
            predict_calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::flat(0.0, 0)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn predict_calls(&self) -> u32 {
        self.predict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelEngine for StubEngine {
    fn name(&self) -> String {
        "stub".to_string()
    }

    async fn predict(
        &self,
        _context: &[Sample],
        _request: &ForecastRequest,
    ) -> Result<Forecast, TaskError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(self.forecast.clone()),
        }
    }

    async fn train(
        &self,
        _history: &[Sample],
        request: &TrainRequest,
    ) -> Result<TrainingArtifact, TaskError> {
        Ok(TrainingArtifact {
            pipeline: request.pipeline.clone(),
            model_id: "stub".to_string(),
            trained_at: request.window_end,
            window_start: request.window_start,
            window_end: request.window_end,
            parameters: BTreeMap::new(),
        })
    }
}

pub struct StubProvider(pub Arc<dyn ModelEngine>);

impl EngineProvider for StubProvider {
    fn engine_for(&self, _pipeline: &Pipeline) -> Result<Arc<dyn ModelEngine>, TaskError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Runner fixture
// =============================================================================

pub struct Fixture {
    pub runner: JobRunner,
    pub ledger: Arc<MemoryResultLedger>,
    pub registry: Arc<MemoryRegistry>,
}

impl Fixture {
    pub fn new(tsdb: Arc<StubTsdb>, engine: Arc<dyn ModelEngine>) -> Self {
        Self::with_provider(tsdb, Arc::new(StubProvider(engine)))
    }

    pub fn with_provider(tsdb: Arc<StubTsdb>, engines: Arc<dyn EngineProvider>) -> Self {
        let ledger = Arc::new(MemoryResultLedger::new());
        let registry = Arc::new(MemoryRegistry::new());
        let runner = JobRunner::new(
            tsdb,
            ledger.clone(),
            registry.clone(),
            engines,
            TaskSettings::default(),
        );
        Self {
            runner,
            ledger,
            registry,
        }
    }
}
