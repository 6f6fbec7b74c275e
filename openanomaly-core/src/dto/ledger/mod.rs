//! Result ledger DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::IdempotencyKey;
use crate::store::ClaimOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub key: IdempotencyKey,
    pub claim_token: String,
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub outcome: ClaimOutcome,
}

/// Body of commit and release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRef {
    pub key: IdempotencyKey,
    pub claim_token: String,
}
