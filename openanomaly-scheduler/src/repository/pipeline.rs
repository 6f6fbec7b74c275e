//! Pipeline Repository
//!
//! Handles all database operations related to pipeline definitions.

use async_trait::async_trait;
use chrono::Utc;
use openanomaly_core::domain::job::PipelineSnapshot;
use openanomaly_core::domain::result::TrainingArtifact;
use openanomaly_core::error::StoreError;
use openanomaly_core::schema;
use openanomaly_core::store::{ArtifactRecorder, PipelineRegistry, RegistryEntry};
use sqlx::PgPool;

use super::backend;

/// Insert or replace a definition, keeping any recorded artifact
pub async fn upsert(
    pool: &PgPool,
    name: &str,
    definition: &serde_json::Value,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO pipelines (name, definition, error, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name) DO UPDATE SET
            definition = EXCLUDED.definition,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(name)
    .bind(definition)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a pipeline by name
pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<RegistryEntry>, sqlx::Error> {
    let row = sqlx::query_as::<_, PipelineRow>(
        "SELECT name, definition, artifact FROM pipelines WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// List all pipelines
pub async fn list_all(pool: &PgPool) -> Result<Vec<RegistryEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PipelineRow>(
        "SELECT name, definition, artifact FROM pipelines ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Attach a training artifact to a pipeline
pub async fn update_artifact(
    pool: &PgPool,
    name: &str,
    artifact: serde_json::Value,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE pipelines SET artifact = $1 WHERE name = $2")
        .bind(artifact)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRegistry for PgRegistry {
    async fn list(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        list_all(&self.pool).await.map_err(backend)
    }

    async fn get(&self, name: &str) -> Result<Option<RegistryEntry>, StoreError> {
        find_by_name(&self.pool, name).await.map_err(backend)
    }

    async fn upsert(&self, definition: serde_json::Value) -> Result<RegistryEntry, StoreError> {
        let name = definition
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Conflict("pipeline definition has no name".to_string()))?
            .to_string();

        let validated = schema::load_pipeline_json(&definition);
        let error = validated.as_ref().err().map(ToString::to_string);
        upsert(&self.pool, &name, &definition, error.as_deref())
            .await
            .map_err(backend)?;

        find_by_name(&self.pool, &name)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline '{name}'")))
    }

    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(&artifact).map_err(|e| StoreError::Backend(e.to_string()))?;
        if !update_artifact(&self.pool, &artifact.pipeline, value)
            .await
            .map_err(backend)?
        {
            return Err(StoreError::NotFound(format!("pipeline '{}'", artifact.pipeline)));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactRecorder for PgRegistry {
    async fn record_artifact(&self, artifact: TrainingArtifact) -> Result<(), StoreError> {
        PipelineRegistry::record_artifact(self, artifact).await
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    name: String,
    definition: serde_json::Value,
    artifact: Option<serde_json::Value>,
}

impl From<PipelineRow> for RegistryEntry {
    fn from(row: PipelineRow) -> Self {
        // An unreadable artifact only costs the fitted parameters.
        let artifact = row
            .artifact
            .and_then(|value| serde_json::from_value::<TrainingArtifact>(value).ok());

        RegistryEntry {
            name: row.name,
            definition: schema::load_pipeline_json(&row.definition)
                .map(|pipeline| PipelineSnapshot { pipeline, artifact }),
        }
    }
}
