//! Storage ports
//!
//! Traits for the shared state the scheduler and worker coordinate through:
//! the pipeline registry, the leader lease, the job queue and the result
//! ledger. The scheduler implements them on PostgreSQL, the worker reaches
//! them over the scheduler's HTTP API, and tests use the in-memory backends.
//!
//! All stores are trait-based to enable testing and substitution.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{IdempotencyKey, Job, JobKind, PipelineSnapshot};
use crate::domain::lease::{FencingToken, Lease};
use crate::domain::result::TrainingArtifact;
use crate::error::{ConfigError, ErrorClass, StoreError};

/// A registry entry: the stored definition, valid or not.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub definition: Result<PipelineSnapshot, ConfigError>,
}

impl RegistryEntry {
    pub fn snapshot(&self) -> Option<&PipelineSnapshot> {
        self.definition.as_ref().ok()
    }
}

/// Durable store of pipeline definitions and their training artifacts.
#[async_trait]
pub trait PipelineRegistry: Send + Sync {
    /// Lists every stored pipeline, including ones that failed validation
    async fn list(&self) -> Result<Vec<RegistryEntry>, StoreError>;

    /// Fetches one pipeline by name
    async fn get(&self, name: &str) -> Result<Option<RegistryEntry>, StoreError>;

    /// Atomically inserts or replaces a definition
    ///
    /// Invalid definitions are stored together with their validation error so
    /// they stay visible; they are never scheduled.
    ///
    /// # Arguments
    /// * `definition` - Raw definition as parsed from the document
    async fn upsert(&self, definition: serde_json::Value) -> Result<RegistryEntry, StoreError>;

    /// Records the artifact of a completed training run
    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError>;
}

/// Write side of the registry, as needed by the worker.
#[async_trait]
pub trait ArtifactRecorder: Send + Sync {
    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError>;
}

/// Leader lease with fencing tokens.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquires the lease if it is free or expired
    ///
    /// Returns the granted lease, with a fencing token strictly greater than
    /// any issued before, or `None` when another holder's lease is live.
    async fn acquire(&self, holder_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError>;

    /// Extends a lease still held by `holder_id` under `token`
    ///
    /// Returns `None` when the lease was lost (expired or taken over).
    async fn renew(
        &self,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Gives the lease up so a standby can take over without waiting for expiry
    async fn release(&self, holder_id: &str, token: FencingToken) -> Result<(), StoreError>;

    /// Current lease, live or not
    async fn current(&self) -> Result<Option<Lease>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same idempotency key already exists.
    Duplicate,
    /// The fencing token is older than the current lease's.
    Fenced,
}

/// How a job finished from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The result was written and committed.
    Committed,
    /// An earlier delivery had already committed this window.
    Duplicate,
    /// Nothing was produced (insufficient data, forecast unavailable).
    Skipped { class: ErrorClass },
}

/// Worker side of the job queue.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Takes the next visible job, hiding it for the visibility timeout
    ///
    /// A job that is not completed or failed before the timeout becomes
    /// visible again with its attempt counter incremented.
    async fn consume(&self, worker_id: &str) -> Result<Option<Job>, StoreError>;

    /// Acknowledges delivery `attempt` of a job
    ///
    /// Only the delivery currently holding a running job may settle it; any
    /// other gets `StoreError::Conflict` and changes nothing.
    async fn complete(
        &self,
        job_id: Uuid,
        attempt: u32,
        outcome: JobOutcome,
    ) -> Result<(), StoreError>;

    /// Reports a failed execution of delivery `attempt`
    ///
    /// # Arguments
    /// * `class` - Classification of the failure
    /// * `requeue` - Whether the job should be made visible for another attempt
    async fn fail(
        &self,
        job_id: Uuid,
        attempt: u32,
        class: ErrorClass,
        requeue: bool,
    ) -> Result<(), StoreError>;
}

/// Scheduler side of the job queue.
#[async_trait]
pub trait JobQueue: JobSource {
    /// Enqueues a job
    ///
    /// Scheduled jobs carry the leader's fencing token; manual triggers pass
    /// `None`. Either way the idempotency key deduplicates.
    async fn enqueue(
        &self,
        job: Job,
        fence: Option<FencingToken>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Most recent due time enqueued for a pipeline and kind
    async fn last_due(
        &self,
        pipeline: &str,
        kind: JobKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The caller may write; it must commit or release afterwards.
    Claimed,
    /// A result for this key is already durable. Do not write.
    AlreadyCommitted,
    /// Another live delivery holds the claim.
    Contended,
}

/// First-write-wins record of committed results per idempotency key.
#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Claims the right to write the result for `key`
    ///
    /// A claim held by a different token is taken over once it is older
    /// than `stale_after`.
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Marks the result as durably written
    async fn commit(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError>;

    /// Drops a claim whose write did not happen
    async fn release(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError>;
}
