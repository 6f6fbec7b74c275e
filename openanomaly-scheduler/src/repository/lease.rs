//! Lease Repository
//!
//! The leader lease is a single row. Every transition is one conditional
//! statement, so the database's row lock is the only tie-break between
//! competing instances. Expiry is judged against the database clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openanomaly_core::domain::lease::{FencingToken, Lease};
use openanomaly_core::error::StoreError;
use openanomaly_core::store::LeaseStore;
use sqlx::PgPool;

use super::backend;

/// Take the lease if it is free or expired, bumping the fencing token
pub async fn try_acquire(
    pool: &PgPool,
    holder_id: &str,
    ttl: Duration,
) -> Result<Option<Lease>, sqlx::Error> {
    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        INSERT INTO leader_lease (id, holder_id, fencing_token, expires_at)
        VALUES (1, $1, 1, now() + make_interval(secs => $2))
        ON CONFLICT (id) DO UPDATE SET
            holder_id = EXCLUDED.holder_id,
            fencing_token = leader_lease.fencing_token + 1,
            expires_at = EXCLUDED.expires_at
        WHERE leader_lease.expires_at <= now()
        RETURNING holder_id, fencing_token, expires_at
        "#,
    )
    .bind(holder_id)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Extend a live lease held by `holder_id` under `token`
pub async fn extend(
    pool: &PgPool,
    holder_id: &str,
    token: FencingToken,
    ttl: Duration,
) -> Result<Option<Lease>, sqlx::Error> {
    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        UPDATE leader_lease
        SET expires_at = now() + make_interval(secs => $3)
        WHERE id = 1 AND holder_id = $1 AND fencing_token = $2 AND expires_at > now()
        RETURNING holder_id, fencing_token, expires_at
        "#,
    )
    .bind(holder_id)
    .bind(token.0 as i64)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Expire the lease immediately. The token is kept so the next holder's is larger.
pub async fn expire(pool: &PgPool, holder_id: &str, token: FencingToken) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE leader_lease
        SET expires_at = now()
        WHERE id = 1 AND holder_id = $1 AND fencing_token = $2
        "#,
    )
    .bind(holder_id)
    .bind(token.0 as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn find(pool: &PgPool) -> Result<Option<Lease>, sqlx::Error> {
    let row = sqlx::query_as::<_, LeaseRow>(
        "SELECT holder_id, fencing_token, expires_at FROM leader_lease WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn acquire(&self, holder_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        try_acquire(&self.pool, holder_id, ttl).await.map_err(backend)
    }

    async fn renew(
        &self,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        extend(&self.pool, holder_id, token, ttl).await.map_err(backend)
    }

    async fn release(&self, holder_id: &str, token: FencingToken) -> Result<(), StoreError> {
        expire(&self.pool, holder_id, token).await.map_err(backend)?;
        Ok(())
    }

    async fn current(&self) -> Result<Option<Lease>, StoreError> {
        find(&self.pool).await.map_err(backend)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LeaseRow {
    holder_id: String,
    fencing_token: i64,
    expires_at: DateTime<Utc>,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            holder_id: row.holder_id,
            fencing_token: FencingToken(row.fencing_token as u64),
            expires_at: row.expires_at,
        }
    }
}
