//! Job poller
//!
//! Polls the scheduler for visible jobs and executes them on a bounded pool.
//! A job is only consumed once a slot is free, so nothing sits claimed in
//! this process while waiting to run.

use std::sync::Arc;
use std::time::Duration;

use openanomaly_core::store::JobSource;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use crate::service::JobRunner;

/// Job poller that continuously pulls jobs and runs them in parallel
pub struct JobPoller {
    worker_id: String,
    poll_interval: Duration,
    source: Arc<dyn JobSource>,
    runner: Arc<JobRunner>,
    semaphore: Arc<Semaphore>,
}

impl JobPoller {
    pub fn new(
        worker_id: String,
        poll_interval: Duration,
        max_parallel_jobs: usize,
        source: Arc<dyn JobSource>,
        runner: Arc<JobRunner>,
    ) -> Self {
        Self {
            worker_id,
            poll_interval,
            source,
            runner,
            semaphore: Arc::new(Semaphore::new(max_parallel_jobs)),
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) {
        info!(
            worker_id = %self.worker_id,
            "Starting job poller (interval: {:?}, slots: {})",
            self.poll_interval,
            self.semaphore.available_permits()
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let started = self.poll_once().await;
            if !started.is_empty() {
                debug!("Started {} job(s) this cycle", started.len());
            }
        }
    }

    /// Consume jobs while slots are free, spawning one task per job
    ///
    /// Returns the handles of the spawned tasks; the loop does not wait on
    /// them, the permits they hold bound the parallelism.
    pub async fn poll_once(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("All job slots busy");
                break;
            };

            let job = match self.source.consume(&self.worker_id).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to consume job: {}", e);
                    break;
                }
            };

            let runner = Arc::clone(&self.runner);
            let source = Arc::clone(&self.source);
            handles.push(tokio::spawn(async move {
                let job_id = job.id;
                if let Err(e) = runner.process(job, source.as_ref()).await {
                    // The job becomes visible again once its visibility timeout passes.
                    error!(%job_id, "Failed to settle job: {}", e);
                }
                drop(permit);
            }));
        }

        handles
    }
}
