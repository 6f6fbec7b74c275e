//! Scheduling loop
//!
//! While this instance holds the lease, every evaluation reads the registry,
//! plans due ticks and enqueues them under the current fencing token.
//! Standby instances evaluate nothing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::{Job, JobKind, PipelineSnapshot};
use openanomaly_core::domain::lease::FencingToken;
use openanomaly_core::error::{ConfigError, StoreError};
use openanomaly_core::schedule::CronSchedule;
use openanomaly_core::store::{EnqueueOutcome, JobQueue, PipelineRegistry, RegistryEntry};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::leader::LeaderElector;
use super::planner::{PlannedTick, TickPlanner};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The queue fenced an enqueue or the local lease deadline passed.
    #[error("leadership lost while acting under token {0}")]
    LeadershipLost(FencingToken),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What one evaluation did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvaluationReport {
    pub enqueued: usize,
    pub duplicates: usize,
    /// Missed ticks superseded by a later one and never enqueued.
    pub discarded: usize,
    /// Pipelines skipped because their definition is invalid.
    pub excluded: usize,
}

pub struct Scheduler {
    registry: Arc<dyn PipelineRegistry>,
    queue: Arc<dyn JobQueue>,
    elector: Arc<LeaderElector>,
    planner: Mutex<TickPlanner>,
    max_attempts: u32,
    rejected: StdMutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn PipelineRegistry>,
        queue: Arc<dyn JobQueue>,
        elector: Arc<LeaderElector>,
        catch_up: bool,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            queue,
            elector,
            planner: Mutex::new(TickPlanner::new(catch_up)),
            max_attempts,
            rejected: StdMutex::new(HashSet::new()),
        }
    }

    /// Evaluate schedules every `interval` forever
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.evaluate_once(Utc::now()).await {
                Ok(report) if report.enqueued > 0 || report.discarded > 0 => {
                    info!(
                        enqueued = report.enqueued,
                        duplicates = report.duplicates,
                        discarded = report.discarded,
                        "evaluation complete"
                    );
                }
                Ok(_) => {}
                Err(SchedulerError::LeadershipLost(token)) => {
                    warn!(token = %token, "scheduling halted: leadership lost");
                }
                Err(e) => error!(error = %e, "evaluation failed"),
            }
        }
    }

    /// One evaluation at `now`
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> Result<EvaluationReport, SchedulerError> {
        let mut planner = self.planner.lock().await;
        let mut report = EvaluationReport::default();

        let Some(token) = self.elector.active_token() else {
            planner.reset();
            return Ok(report);
        };
        if planner.begin_term(token) {
            info!(token = %token, catch_up = planner.catch_up(), "starting scheduling term");
        }

        let entries = self.registry.list().await?;
        let mut scheduled = HashSet::new();

        for entry in entries {
            let Some(snapshot) = self.schedulable(&entry, &mut report) else {
                continue;
            };

            for kind in JobKind::ALL {
                let Some(expression) = snapshot.pipeline.schedule_for(kind) else {
                    continue;
                };
                let schedule = match CronSchedule::parse(expression) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        warn!(pipeline = %entry.name, kind = %kind, error = %e, "unusable schedule");
                        continue;
                    }
                };
                scheduled.insert((entry.name.clone(), kind));

                if !planner.has_cursor(&entry.name, kind) {
                    let last_due = if planner.catch_up() {
                        self.queue.last_due(&entry.name, kind).await?
                    } else {
                        None
                    };
                    planner.seed(&entry.name, kind, last_due, now);
                }

                let Some(planned) = planner.due(&entry.name, kind, &schedule, now) else {
                    continue;
                };
                if planned.discarded > 0 {
                    warn!(
                        pipeline = %entry.name,
                        kind = %kind,
                        discarded = planned.discarded,
                        due_at = %planned.tick.due_at,
                        "missed ticks discarded; enqueuing only the latest"
                    );
                    report.discarded += planned.discarded;
                }

                match self.enqueue(token, &planned, snapshot, now).await {
                    Ok(outcome) => {
                        planner.advance(&entry.name, kind, planned.tick.due_at);
                        match outcome {
                            EnqueueOutcome::Enqueued => report.enqueued += 1,
                            _ => report.duplicates += 1,
                        }
                    }
                    Err(SchedulerError::Config(e)) => {
                        warn!(pipeline = %entry.name, kind = %kind, error = %e, "tick skipped");
                        planner.advance(&entry.name, kind, planned.tick.due_at);
                    }
                    Err(e) => {
                        if matches!(e, SchedulerError::LeadershipLost(_)) {
                            planner.reset();
                        }
                        return Err(e);
                    }
                }
            }
        }

        planner.retain(&scheduled);
        Ok(report)
    }

    async fn enqueue(
        &self,
        token: FencingToken,
        planned: &PlannedTick,
        snapshot: &PipelineSnapshot,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, SchedulerError> {
        // The deadline may have passed while the registry was being read.
        if self.elector.active_token() != Some(token) {
            return Err(SchedulerError::LeadershipLost(token));
        }

        let job = Job::for_tick(&planned.tick, snapshot.clone(), self.max_attempts, now)?;
        let job_id = job.id;
        let key = job.idempotency_key.clone();
        let not_before = job.not_before;

        match self.queue.enqueue(job, Some(token)).await? {
            EnqueueOutcome::Enqueued => {
                info!(
                    pipeline = %planned.tick.pipeline,
                    kind = %planned.tick.kind,
                    due_at = %planned.tick.due_at,
                    %not_before,
                    %job_id,
                    "job enqueued"
                );
                Ok(EnqueueOutcome::Enqueued)
            }
            EnqueueOutcome::Duplicate => {
                debug!(pipeline = %planned.tick.pipeline, kind = %planned.tick.kind, %key, "tick already enqueued");
                Ok(EnqueueOutcome::Duplicate)
            }
            EnqueueOutcome::Fenced => {
                self.elector.demote("enqueue rejected by fencing token");
                Err(SchedulerError::LeadershipLost(token))
            }
        }
    }

    /// Snapshot of an enabled, valid pipeline. Invalid ones are reported once
    /// per definition and excluded.
    fn schedulable<'a>(
        &self,
        entry: &'a RegistryEntry,
        report: &mut EvaluationReport,
    ) -> Option<&'a PipelineSnapshot> {
        let mut rejected = self.rejected.lock().unwrap_or_else(|p| p.into_inner());
        match &entry.definition {
            Ok(snapshot) => {
                rejected.remove(&entry.name);
                snapshot.pipeline.enabled.then_some(snapshot)
            }
            Err(e) => {
                if rejected.insert(entry.name.clone()) {
                    warn!(
                        pipeline = %entry.name,
                        error_class = "config_validation",
                        error = %e,
                        "pipeline excluded from scheduling"
                    );
                }
                report.excluded += 1;
                None
            }
        }
    }
}
