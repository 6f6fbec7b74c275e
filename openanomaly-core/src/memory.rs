//! In-memory backends
//!
//! Single-process implementations of the storage ports. Expiry is measured
//! with `tokio::time::Instant`, so tests can drive it with paused time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::job::{IdempotencyKey, Job, JobKind, JobStatus, PipelineSnapshot};
use crate::domain::lease::{FencingToken, Lease};
use crate::domain::pipeline::Pipeline;
use crate::domain::result::TrainingArtifact;
use crate::error::{ErrorClass, StoreError};
use crate::schema;
use crate::store::{
    ArtifactRecorder, ClaimOutcome, EnqueueOutcome, JobOutcome, JobQueue, JobSource, LeaseStore,
    PipelineRegistry, RegistryEntry, ResultLedger,
};

fn wall_clock_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

// ============================================================================
// Lease
// ============================================================================

#[derive(Debug)]
struct HeldLease {
    holder_id: String,
    token: FencingToken,
    expires: Instant,
    expires_at: DateTime<Utc>,
}

impl HeldLease {
    fn to_lease(&self) -> Lease {
        Lease {
            holder_id: self.holder_id.clone(),
            fencing_token: self.token,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Default)]
struct LeaseState {
    held: Option<HeldLease>,
    last_token: u64,
}

#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: Mutex<LeaseState>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the lease if it is currently unexpired.
    pub async fn live_token(&self) -> Option<FencingToken> {
        let state = self.state.lock().await;
        state
            .held
            .as_ref()
            .filter(|held| held.expires > Instant::now())
            .map(|held| held.token)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(&self, holder_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.held.as_ref().is_some_and(|held| held.expires > now) {
            return Ok(None);
        }

        state.last_token += 1;
        let held = HeldLease {
            holder_id: holder_id.to_string(),
            token: FencingToken(state.last_token),
            expires: now + ttl,
            expires_at: wall_clock_after(ttl),
        };
        let lease = held.to_lease();
        state.held = Some(held);
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.held.as_mut() {
            Some(held) if held.holder_id == holder_id && held.token == token && held.expires > now => {
                held.expires = now + ttl;
                held.expires_at = wall_clock_after(ttl);
                Ok(Some(held.to_lease()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, holder_id: &str, token: FencingToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .held
            .as_ref()
            .is_some_and(|held| held.holder_id == holder_id && held.token == token)
        {
            state.held = None;
        }
        Ok(())
    }

    async fn current(&self) -> Result<Option<Lease>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.held.as_ref().map(HeldLease::to_lease))
    }
}

// ============================================================================
// Job queue
// ============================================================================

#[derive(Debug, Clone)]
struct QueueEntry {
    job: Job,
    status: JobStatus,
    visible_at: Instant,
    last_error: Option<ErrorClass>,
}

/// Queue with visibility timeouts, delayed delivery and idempotent enqueue.
///
/// When built with [`MemoryJobQueue::fenced_by`], fenced enqueues are checked
/// against the lease store's live token.
#[derive(Debug)]
pub struct MemoryJobQueue {
    entries: Mutex<Vec<QueueEntry>>,
    visibility_timeout: Duration,
    max_attempts: u32,
    lease: Option<Arc<MemoryLeaseStore>>,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            visibility_timeout,
            max_attempts,
            lease: None,
        }
    }

    pub fn fenced_by(mut self, lease: Arc<MemoryLeaseStore>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        let entries = self.entries.lock().await;
        entries.iter().find(|e| e.job.id == job_id).map(|e| e.status)
    }

    pub async fn last_error(&self, job_id: Uuid) -> Option<ErrorClass> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|e| e.job.id == job_id)
            .and_then(|e| e.last_error)
    }

    /// Every job with its status, in enqueue order.
    pub async fn snapshot(&self) -> Vec<(Job, JobStatus)> {
        let entries = self.entries.lock().await;
        entries.iter().map(|e| (e.job.clone(), e.status)).collect()
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        attempt: u32,
        status: JobStatus,
        class: Option<ErrorClass>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.job.id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if entry.status != JobStatus::Running || entry.job.attempt != attempt {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is no longer held by delivery {attempt}"
            )));
        }
        entry.status = status;
        entry.last_error = class;
        if status == JobStatus::Queued {
            entry.visible_at = Instant::now();
        }
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryJobQueue {
    async fn consume(&self, _worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        // Deliveries that outlived their visibility with no attempts left.
        for entry in entries.iter_mut() {
            if entry.status == JobStatus::Running
                && entry.visible_at <= now
                && entry.job.attempt >= entry.job.max_attempts
            {
                entry.status = JobStatus::Lost;
                entry.last_error = Some(ErrorClass::Timeout);
            }
        }

        let next = entries
            .iter_mut()
            .filter(|e| matches!(e.status, JobStatus::Queued | JobStatus::Running))
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| e.job.due_at);

        Ok(next.map(|entry| {
            entry.status = JobStatus::Running;
            entry.job.attempt += 1;
            entry.visible_at = now + self.visibility_timeout;
            entry.job.clone()
        }))
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
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        mut job: Job,
        fence: Option<FencingToken>,
    ) -> Result<EnqueueOutcome, StoreError> {
        if let (Some(token), Some(lease)) = (fence, self.lease.as_ref()) {
            if lease.live_token().await != Some(token) {
                return Ok(EnqueueOutcome::Fenced);
            }
        }

        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|e| e.job.idempotency_key == job.idempotency_key)
        {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let delay = (job.not_before - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        job.attempt = 0;
        job.max_attempts = self.max_attempts;
        entries.push(QueueEntry {
            job,
            status: JobStatus::Queued,
            visible_at: Instant::now() + delay,
            last_error: None,
        });
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn last_due(
        &self,
        pipeline: &str,
        kind: JobKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.job.kind == kind && e.job.pipeline().name == pipeline)
            .map(|e| e.job.due_at)
            .max())
    }
}

// ============================================================================
// Result ledger
// ============================================================================

#[derive(Debug)]
struct LedgerEntry {
    claim_token: String,
    committed: bool,
    claimed_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryResultLedger {
    entries: Mutex<HashMap<IdempotencyKey, LedgerEntry>>,
}

impl MemoryResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_committed(&self, key: &IdempotencyKey) -> bool {
        let entries = self.entries.lock().await;
        entries.get(key).is_some_and(|e| e.committed)
    }
}

#[async_trait]
impl ResultLedger for MemoryResultLedger {
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_token: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.committed => Ok(ClaimOutcome::AlreadyCommitted),
            Some(entry)
                if entry.claim_token == claim_token || entry.claimed_at + stale_after <= now =>
            {
                entry.claim_token = claim_token.to_string();
                entry.claimed_at = now;
                Ok(ClaimOutcome::Claimed)
            }
            Some(_) => Ok(ClaimOutcome::Contended),
            None => {
                entries.insert(
                    key.clone(),
                    LedgerEntry {
                        claim_token: claim_token.to_string(),
                        committed: false,
                        claimed_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn commit(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.claim_token == claim_token => {
                entry.committed = true;
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!(
                "claim on {key} is held by another delivery"
            ))),
            None => Err(StoreError::NotFound(format!("claim on {key}"))),
        }
    }

    async fn release(&self, key: &IdempotencyKey, claim_token: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries
            .get(key)
            .is_some_and(|e| !e.committed && e.claim_token == claim_token)
        {
            entries.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline registry
// ============================================================================

#[derive(Debug, Clone)]
struct StoredPipeline {
    definition: serde_json::Value,
    artifact: Option<TrainingArtifact>,
}

impl StoredPipeline {
    fn to_entry(&self, name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            definition: schema::load_pipeline_json(&self.definition).map(|pipeline| {
                PipelineSnapshot {
                    pipeline,
                    artifact: self.artifact.clone(),
                }
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    pipelines: Mutex<BTreeMap<String, StoredPipeline>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an already-parsed pipeline.
    pub async fn insert(&self, pipeline: &Pipeline) -> Result<RegistryEntry, StoreError> {
        let definition =
            serde_json::to_value(pipeline).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.upsert(definition).await
    }
}

#[async_trait]
impl PipelineRegistry for MemoryRegistry {
    async fn list(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        let pipelines = self.pipelines.lock().await;
        Ok(pipelines
            .iter()
            .map(|(name, stored)| stored.to_entry(name))
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<RegistryEntry>, StoreError> {
        let pipelines = self.pipelines.lock().await;
        Ok(pipelines.get(name).map(|stored| stored.to_entry(name)))
    }

    async fn upsert(&self, definition: serde_json::Value) -> Result<RegistryEntry, StoreError> {
        let name = definition
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Conflict("pipeline definition has no name".to_string()))?
            .to_string();

        let mut pipelines = self.pipelines.lock().await;
        let artifact = pipelines.get(&name).and_then(|p| p.artifact.clone());
        let stored = StoredPipeline {
            definition,
            artifact,
        };
        let entry = stored.to_entry(&name);
        pipelines.insert(name, stored);
        Ok(entry)
    }

    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.lock().await;
        let stored = pipelines
            .get_mut(&artifact.pipeline)
            .ok_or_else(|| StoreError::NotFound(format!("pipeline '{}'", artifact.pipeline)))?;
        stored.artifact = Some(artifact);
        Ok(())
    }
}

#[async_trait]
impl ArtifactRecorder for MemoryRegistry {
    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError> {
        PipelineRegistry::record_artifact(self, artifact).await
    }
}
