//! Job queue endpoints

use async_trait::async_trait;
use openanomaly_core::domain::job::Job;
use openanomaly_core::dto::job::{CompleteJob, ConsumeRequest, FailJob};
use openanomaly_core::error::{ErrorClass, StoreError};
use openanomaly_core::store::{JobOutcome, JobSource};
use uuid::Uuid;

use crate::SchedulerClient;
use crate::error::Result;

impl SchedulerClient {
    // =============================================================================
    // Job Queue (worker-specific)
    // =============================================================================

    /// Take the next visible job, if any
    ///
    /// # Arguments
    /// * `worker_id` - The ID of the consuming worker
    pub async fn consume_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let url = format!("{}/api/jobs/consume", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ConsumeRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Acknowledge delivery `attempt` of a job
    pub async fn complete_job(&self, job_id: Uuid, attempt: u32, outcome: JobOutcome) -> Result<()> {
        let url = format!("{}/api/jobs/{}/complete", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&CompleteJob { attempt, outcome })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Report a failed job execution
    ///
    /// # Arguments
    /// * `job_id` - The failed job
    /// * `attempt` - The delivery that failed
    /// * `class` - Failure classification
    /// * `requeue` - Whether the job should be retried
    pub async fn fail_job(
        &self,
        job_id: Uuid,
        attempt: u32,
        class: ErrorClass,
        requeue: bool,
    ) -> Result<()> {
        let url = format!("{}/api/jobs/{}/fail", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&FailJob {
                attempt,
                class,
                requeue,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

#[async_trait]
impl JobSource for SchedulerClient {
    async fn consume(&self, worker_id: &str) -> std::result::Result<Option<Job>, StoreError> {
        Ok(self.consume_job(worker_id).await?)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        attempt: u32,
        outcome: JobOutcome,
    ) -> std::result::Result<(), StoreError> {
        Ok(self.complete_job(job_id, attempt, outcome).await?)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        attempt: u32,
        class: ErrorClass,
        requeue: bool,
    ) -> std::result::Result<(), StoreError> {
        Ok(self.fail_job(job_id, attempt, class, requeue).await?)
    }
}
