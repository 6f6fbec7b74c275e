//! OpenAnomaly Worker
//!
//! A stateless process that executes forecast, anomaly and training jobs.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Engines: Local model backends and the remote model client
//! - Services: Task bodies and the runtime that commits their results
//! - Poller: Job consumption on a bounded pool
//!
//! Workers hold no schedule state. Any number of them can poll the same
//! scheduler; the queue and the result ledger keep each tick's result
//! written once.

mod config;
mod engine;
mod poller;
mod service;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use openanomaly_client::{PrometheusClient, SchedulerClient};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::engine::BackendFactory;
use crate::poller::JobPoller;
use crate::service::{JobRunner, TaskSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openanomaly_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OpenAnomaly worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: worker_id={}, scheduler_url={}, prometheus_url={}",
        config.worker_id, config.scheduler_url, config.prometheus_url
    );

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let scheduler = Arc::new(SchedulerClient::with_client(
        config.scheduler_url.clone(),
        http.clone(),
    ));
    let prometheus = Arc::new(PrometheusClient::new(
        config.prometheus_url.clone(),
        config.prometheus_write_url.clone(),
        http.clone(),
    ));

    wait_for_scheduler(&scheduler).await?;

    let settings = TaskSettings {
        task_timeout: config.task_timeout,
        write_retries: config.write_retries,
        min_context_fraction: config.min_context_fraction,
        claim_stale_after: config.claim_stale_after,
        ..TaskSettings::default()
    };
    let runner = Arc::new(JobRunner::new(
        prometheus,
        scheduler.clone(),
        scheduler.clone(),
        Arc::new(BackendFactory::new(http)),
        settings,
    ));

    let poller = JobPoller::new(
        config.worker_id.clone(),
        config.poll_interval,
        config.max_parallel_jobs,
        scheduler,
        runner,
    );

    info!(
        "Worker initialized (poll interval: {:?}, parallel jobs: {}, task timeout: {:?})",
        config.poll_interval, config.max_parallel_jobs, config.task_timeout
    );

    tokio::select! {
        _ = poller.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down worker");
        }
    }

    Ok(())
}

/// Wait for the scheduler with exponential backoff
///
/// The scheduler may not be ready yet when the worker starts (common in
/// container environments).
async fn wait_for_scheduler(client: &SchedulerClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.health().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Scheduler reachable after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Scheduler unreachable after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Scheduler is not reachable: {}", e));
                }

                warn!(
                    "Scheduler not reachable (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
