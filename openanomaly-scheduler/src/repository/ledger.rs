//! Ledger Repository
//!
//! First-write-wins record of results per idempotency key.

use std::time::Duration;

use async_trait::async_trait;
use openanomaly_core::domain::job::IdempotencyKey;
use openanomaly_core::error::StoreError;
use openanomaly_core::store::{ClaimOutcome, ResultLedger};
use sqlx::PgPool;

use super::backend;

/// Claim a key for `claim_token`
///
/// The upsert only takes over an uncommitted claim that is ours or stale;
/// when it matches nothing the existing row tells committed from contended.
pub async fn claim(
    pool: &PgPool,
    key: &str,
    claim_token: &str,
    stale_after: Duration,
) -> Result<ClaimOutcome, sqlx::Error> {
    let claimed: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO result_ledger (key, claim_token, committed, claimed_at)
        VALUES ($1, $2, FALSE, now())
        ON CONFLICT (key) DO UPDATE SET
            claim_token = EXCLUDED.claim_token,
            claimed_at = EXCLUDED.claimed_at
        WHERE NOT result_ledger.committed
          AND (result_ledger.claim_token = EXCLUDED.claim_token
               OR result_ledger.claimed_at <= now() - make_interval(secs => $3))
        RETURNING key
        "#,
    )
    .bind(key)
    .bind(claim_token)
    .bind(stale_after.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    if claimed.is_some() {
        return Ok(ClaimOutcome::Claimed);
    }

    let committed: Option<bool> =
        sqlx::query_scalar("SELECT committed FROM result_ledger WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(match committed {
        Some(true) => ClaimOutcome::AlreadyCommitted,
        _ => ClaimOutcome::Contended,
    })
}

/// Finalize a claim. Returns false when the claim is not held by `claim_token`.
pub async fn commit(pool: &PgPool, key: &str, claim_token: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE result_ledger
        SET committed = TRUE, committed_at = now()
        WHERE key = $1 AND claim_token = $2
        "#,
    )
    .bind(key)
    .bind(claim_token)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Drop an uncommitted claim
pub async fn release(pool: &PgPool, key: &str, claim_token: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM result_ledger WHERE key = $1 AND claim_token = $2 AND NOT committed",
    )
    .bind(key)
    .bind(claim_token)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct PgResultLedger {
    pool: PgPool,
}

impl PgResultLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultLedger for PgResultLedger {
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        claim(&self.pool, key.as_str(), claim_token, stale_after)
            .await
            .map_err(backend)
    }

    async fn commit(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError> {
        if commit(&self.pool, key.as_str(), claim_token)
            .await
            .map_err(backend)?
        {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "claim on {key} is not held by {claim_token}"
            )))
        }
    }

    async fn release(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError> {
        release(&self.pool, key.as_str(), claim_token)
            .await
            .map_err(backend)
    }
}
