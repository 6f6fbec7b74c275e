use std::sync::Arc;

use anyhow::Context;
use openanomaly_core::store::{JobQueue, LeaseStore, PipelineRegistry, ResultLedger};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;

use crate::config::Config;
use crate::repository::{PgJobQueue, PgLeaseStore, PgRegistry, PgResultLedger};
use crate::service::{LeaderElector, Scheduler, pipeline_service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openanomaly_scheduler=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting OpenAnomaly Scheduler...");

    let config = Config::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        instance_id = %config.instance_id,
        lease_ttl = ?config.lease_ttl,
        "Connecting to database..."
    );

    let pool = db::create_pool(&config.database_url)
        .await
        .context("failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let registry: Arc<dyn PipelineRegistry> = Arc::new(PgRegistry::new(pool.clone()));
    let lease: Arc<dyn LeaseStore> = Arc::new(PgLeaseStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), config.visibility_timeout));
    let ledger: Arc<dyn ResultLedger> = Arc::new(PgResultLedger::new(pool));

    if let Some(path) = &config.pipelines_file {
        pipeline_service::seed_from_file(registry.as_ref(), path)
            .await
            .with_context(|| format!("failed to seed pipelines from {}", path.display()))?;
    }

    let elector = Arc::new(LeaderElector::new(
        lease.clone(),
        config.instance_id.clone(),
        config.lease_ttl,
    ));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        queue.clone(),
        elector.clone(),
        config.catch_up_missed_tick,
        config.max_attempts,
    ));

    let election = tokio::spawn({
        let elector = elector.clone();
        async move { elector.run().await }
    });
    let scheduling = tokio::spawn({
        let scheduler = scheduler.clone();
        let interval = config.evaluation_interval;
        async move { scheduler.run(interval).await }
    });

    let app = api::create_router(api::AppState {
        registry,
        queue,
        ledger,
        lease,
        elector: elector.clone(),
        max_attempts: config.max_attempts,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("server error")?;

    tracing::info!("Shutting down");
    election.abort();
    scheduling.abort();
    elector.resign().await;

    Ok(())
}
