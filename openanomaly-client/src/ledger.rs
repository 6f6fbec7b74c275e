//! Result ledger endpoints

use std::time::Duration;

use async_trait::async_trait;
use openanomaly_core::domain::job::IdempotencyKey;
use openanomaly_core::dto::ledger::{ClaimRef, ClaimRequest, ClaimResponse};
use openanomaly_core::error::StoreError;
use openanomaly_core::store::{ClaimOutcome, ResultLedger};

use crate::SchedulerClient;
use crate::error::Result;

impl SchedulerClient {
    // =============================================================================
    // Result Ledger
    // =============================================================================

    /// Claim the right to write the result for an idempotency key
    pub async fn claim_result(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome> {
        let url = format!("{}/api/ledger/claim", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ClaimRequest {
                key: key.clone(),
                claim_token: claim_token.to_string(),
                stale_after_secs: stale_after.as_secs(),
            })
            .send()
            .await?;

        let body: ClaimResponse = self.handle_response(response).await?;
        Ok(body.outcome)
    }

    /// Mark a claimed result as durably written
    pub async fn commit_result(&self, key: &IdempotencyKey, claim_token: &str) -> Result<()> {
        self.post_claim_ref("commit", key, claim_token).await
    }

    /// Drop a claim after a failed write
    pub async fn release_result(&self, key: &IdempotencyKey, claim_token: &str) -> Result<()> {
        self.post_claim_ref("release", key, claim_token).await
    }

    async fn post_claim_ref(&self, action: &str, key: &IdempotencyKey, claim_token: &str) -> Result<()> {
        let url = format!("{}/api/ledger/{}", self.base_url, action);
        let response = self
            .client
            .post(&url)
            .json(&ClaimRef {
                key: key.clone(),
                claim_token: claim_token.to_string(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

#[async_trait]
impl ResultLedger for SchedulerClient {
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
        stale_after: Duration,
    ) -> std::result::Result<ClaimOutcome, StoreError> {
        Ok(self.claim_result(key, claim_token, stale_after).await?)
    }

    async fn commit(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
    ) -> std::result::Result<(), StoreError> {
        Ok(self.commit_result(key, claim_token).await?)
    }

    async fn release(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
    ) -> std::result::Result<(), StoreError> {
        Ok(self.release_result(key, claim_token).await?)
    }
}
