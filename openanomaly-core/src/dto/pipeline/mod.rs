//! Pipeline DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::PipelineSnapshot;
use crate::domain::pipeline::PipelineMode;
use crate::store::RegistryEntry;

/// Pipeline list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub name: String,
    pub valid: bool,
    pub enabled: bool,
    pub mode: Option<PipelineMode>,
    pub model: Option<String>,
    pub error: Option<String>,
}

impl From<&RegistryEntry> for PipelineSummary {
    fn from(entry: &RegistryEntry) -> Self {
        match &entry.definition {
            Ok(snapshot) => Self {
                name: entry.name.clone(),
                valid: true,
                enabled: snapshot.pipeline.enabled,
                mode: Some(snapshot.pipeline.mode),
                model: Some(snapshot.pipeline.model.describe()),
                error: None,
            },
            Err(e) => Self {
                name: entry.name.clone(),
                valid: false,
                enabled: false,
                mode: None,
                model: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Full pipeline as stored, or the reason it was rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDetail {
    pub name: String,
    pub snapshot: Option<PipelineSnapshot>,
    pub error: Option<String>,
}

impl From<RegistryEntry> for PipelineDetail {
    fn from(entry: RegistryEntry) -> Self {
        match entry.definition {
            Ok(snapshot) => Self {
                name: entry.name,
                snapshot: Some(snapshot),
                error: None,
            },
            Err(e) => Self {
                name: entry.name,
                snapshot: None,
                error: Some(e.to_string()),
            },
        }
    }
}
