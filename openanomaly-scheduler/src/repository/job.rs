//! Job Repository
//!
//! The job queue on Postgres. Consumers lock candidate rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never receive the same
//! delivery, and a consumed job stays hidden until `visible_at`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openanomaly_core::domain::job::{IdempotencyKey, Job, JobKind, JobStatus, PipelineSnapshot};
use openanomaly_core::domain::lease::FencingToken;
use openanomaly_core::error::{ErrorClass, StoreError};
use openanomaly_core::store::{EnqueueOutcome, JobOutcome, JobQueue, JobSource};
use sqlx::PgPool;
use uuid::Uuid;

use super::backend;

/// Insert a job unless its idempotency key is already queued
///
/// With a fence, the lease row is share-locked for the duration of the
/// insert so a takeover cannot interleave with it.
pub async fn create(
    pool: &PgPool,
    job: &Job,
    fence: Option<FencingToken>,
) -> Result<EnqueueOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    if let Some(token) = fence {
        let live: Option<i64> = sqlx::query_scalar(
            "SELECT fencing_token FROM leader_lease WHERE id = 1 AND expires_at > now() FOR SHARE",
        )
        .fetch_optional(&mut *tx)
        .await?;

        if live != Some(token.0 as i64) {
            tx.rollback().await?;
            return Ok(EnqueueOutcome::Fenced);
        }
    }

    let snapshot = serde_json::to_value(&job.snapshot)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let result = sqlx::query(
        r#"
        INSERT INTO jobs (id, pipeline, kind, due_at, not_before, enqueued_at, idempotency_key,
                          status, attempt, max_attempts, visible_at, snapshot, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', 0, $8, GREATEST($5, now()), $9, now())
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(job.id)
    .bind(&job.pipeline().name)
    .bind(job.kind.as_str())
    .bind(job.due_at)
    .bind(job.not_before)
    .bind(job.enqueued_at)
    .bind(job.idempotency_key.as_str())
    .bind(job.max_attempts as i32)
    .bind(snapshot)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(if result.rows_affected() > 0 {
        EnqueueOutcome::Enqueued
    } else {
        EnqueueOutcome::Duplicate
    })
}

/// Mark running jobs whose last delivery timed out with no attempts left as lost
pub async fn expire_exhausted(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'lost', last_error = 'timeout', updated_at = now()
        WHERE status = 'running' AND visible_at <= now() AND attempt >= max_attempts
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Deliver the next visible job to `worker_id`
pub async fn take_next(
    pool: &PgPool,
    worker_id: &str,
    visibility_timeout: Duration,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE jobs
        SET status = 'running',
            attempt = attempt + 1,
            visible_at = now() + make_interval(secs => $2),
            worker_id = $1,
            updated_at = now()
        WHERE id = (
            SELECT id FROM jobs
            WHERE visible_at <= now()
              AND (status = 'queued' OR (status = 'running' AND attempt < max_attempts))
            ORDER BY due_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, kind, due_at, not_before, enqueued_at, idempotency_key,
                  attempt, max_attempts, snapshot
        "#,
    )
    .bind(worker_id)
    .bind(visibility_timeout.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    row.map(Job::try_from).transpose()
}

/// Settle the running delivery `attempt` of a job; requeued jobs become
/// visible immediately. Returns false when that delivery no longer holds it.
pub async fn update_status(
    pool: &PgPool,
    job_id: Uuid,
    attempt: u32,
    status: JobStatus,
    class: Option<ErrorClass>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            last_error = $2,
            visible_at = CASE WHEN $1 = 'queued' THEN now() ELSE visible_at END,
            updated_at = now()
        WHERE id = $3 AND attempt = $4 AND status = 'running'
        "#,
    )
    .bind(status.as_str())
    .bind(class.map(|c| c.as_str()))
    .bind(job_id)
    .bind(attempt as i32)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Whether a job exists at all
pub async fn exists(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
        .bind(job_id)
        .fetch_one(pool)
        .await
}

/// Latest due time enqueued for a pipeline and kind
pub async fn find_last_due(
    pool: &PgPool,
    pipeline: &str,
    kind: JobKind,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar("SELECT max(due_at) FROM jobs WHERE pipeline = $1 AND kind = $2")
        .bind(pipeline)
        .bind(kind.as_str())
        .fetch_one(pool)
        .await
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        attempt: u32,
        status: JobStatus,
        class: Option<ErrorClass>,
    ) -> Result<(), StoreError> {
        if update_status(&self.pool, job_id, attempt, status, class)
            .await
            .map_err(backend)?
        {
            return Ok(());
        }
        if exists(&self.pool, job_id).await.map_err(backend)? {
            Err(StoreError::Conflict(format!(
                "job {job_id} is no longer held by delivery {attempt}"
            )))
        } else {
            Err(StoreError::NotFound(format!("job {job_id}")))
        }
    }
}

#[async_trait]
impl JobSource for PgJobQueue {
    async fn consume(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let lost = expire_exhausted(&self.pool).await.map_err(backend)?;
        if lost > 0 {
            tracing::warn!(count = lost, "jobs lost after exhausting their attempts");
        }
        take_next(&self.pool, worker_id, self.visibility_timeout)
            .await
            .map_err(backend)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        attempt: u32,
        outcome: JobOutcome,
    ) -> Result<(), StoreError> {
        match outcome {
            JobOutcome::Committed | JobOutcome::Duplicate => {
                self.set_status(job_id, attempt, JobStatus::Succeeded, None).await
            }
            JobOutcome::Skipped { class } => {
                self.set_status(job_id, attempt, JobStatus::Skipped, Some(class))
                    .await
            }
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        attempt: u32,
        class: ErrorClass,
        requeue: bool,
    ) -> Result<(), StoreError> {
        let status = if requeue {
            JobStatus::Queued
        } else if class == ErrorClass::Write {
            JobStatus::Lost
        } else {
            JobStatus::Failed
        };
        self.set_status(job_id, attempt, status, Some(class)).await
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        job: Job,
        fence: Option<FencingToken>,
    ) -> Result<EnqueueOutcome, StoreError> {
        create(&self.pool, &job, fence).await.map_err(backend)
    }

    async fn last_due(
        &self,
        pipeline: &str,
        kind: JobKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        find_last_due(&self.pool, pipeline, kind)
            .await
            .map_err(backend)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    due_at: DateTime<Utc>,
    not_before: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    idempotency_key: String,
    attempt: i32,
    max_attempts: i32,
    snapshot: serde_json::Value,
}

impl TryFrom<JobRow> for Job {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<JobKind>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let snapshot: PipelineSnapshot =
            serde_json::from_value(row.snapshot).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Job {
            id: row.id,
            kind,
            due_at: row.due_at,
            not_before: row.not_before,
            enqueued_at: row.enqueued_at,
            idempotency_key: IdempotencyKey::from_raw(row.idempotency_key),
            attempt: row.attempt as u32,
            max_attempts: row.max_attempts as u32,
            snapshot,
        })
    }
}
