use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Pipeline registry. Definitions are stored raw so rejected entries stay
    // visible together with their validation error.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            name TEXT PRIMARY KEY,
            definition JSONB NOT NULL,
            error TEXT,
            artifact JSONB,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row leader lease
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leader_lease (
            id SMALLINT PRIMARY KEY CHECK (id = 1),
            holder_id TEXT NOT NULL,
            fencing_token BIGINT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Job queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            pipeline TEXT NOT NULL,
            kind VARCHAR(20) NOT NULL,
            due_at TIMESTAMPTZ NOT NULL,
            not_before TIMESTAMPTZ NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status VARCHAR(20) NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            worker_id TEXT,
            last_error VARCHAR(40),
            snapshot JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Result ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS result_ledger (
            key TEXT PRIMARY KEY,
            claim_token TEXT NOT NULL,
            committed BOOLEAN NOT NULL DEFAULT FALSE,
            claimed_at TIMESTAMPTZ NOT NULL,
            committed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_visible ON jobs(status, visible_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_kind_due ON jobs(pipeline, kind, due_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
