//! Job DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{IdempotencyKey, JobKind};
use crate::error::ErrorClass;
use crate::store::{EnqueueOutcome, JobOutcome};

/// Worker request for the next visible job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub worker_id: String,
}

/// Settles are tied to one delivery by its attempt number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteJob {
    pub attempt: u32,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailJob {
    pub attempt: u32,
    pub class: ErrorClass,
    pub requeue: bool,
}

/// Result of a manual trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job_id: Uuid,
    pub pipeline: String,
    pub kind: JobKind,
    pub due_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    pub outcome: EnqueueOutcome,
}
