//! Pipeline and leadership endpoints

use async_trait::async_trait;
use openanomaly_core::domain::job::JobKind;
use openanomaly_core::domain::result::TrainingArtifact;
use openanomaly_core::dto::job::TriggerResponse;
use openanomaly_core::dto::leader::LeaderStatus;
use openanomaly_core::dto::pipeline::{PipelineDetail, PipelineSummary};
use openanomaly_core::error::StoreError;
use openanomaly_core::store::ArtifactRecorder;

use crate::SchedulerClient;
use crate::error::Result;

impl SchedulerClient {
    // =============================================================================
    // Pipelines
    // =============================================================================

    /// List all registered pipelines, including rejected definitions
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/api/pipelines", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a pipeline by name
    pub async fn get_pipeline(&self, name: &str) -> Result<PipelineDetail> {
        let url = format!("{}/api/pipelines/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Enqueue an out-of-schedule job for a pipeline
    ///
    /// # Arguments
    /// * `name` - The pipeline name
    /// * `kind` - Which task to run
    pub async fn trigger(&self, name: &str, kind: JobKind) -> Result<TriggerResponse> {
        let url = format!("{}/api/pipelines/{}/trigger/{}", self.base_url, name, kind);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Store the artifact of a completed training run
    pub async fn record_training_artifact(&self, artifact: &TrainingArtifact) -> Result<()> {
        let url = format!("{}/api/pipelines/{}/artifact", self.base_url, artifact.pipeline);
        let response = self.client.post(&url).json(artifact).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Health & Leadership
    // =============================================================================

    /// Role of the scheduler instance answering the request
    pub async fn leader_status(&self) -> Result<LeaderStatus> {
        let url = format!("{}/api/leader", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_empty_response(response).await
    }
}

#[async_trait]
impl ArtifactRecorder for SchedulerClient {
    async fn record_artifact(&self, artifact: TrainingArtifact) -> std::result::Result<(), StoreError> {
        Ok(self.record_training_artifact(&artifact).await?)
    }
}
