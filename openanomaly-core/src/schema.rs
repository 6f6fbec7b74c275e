//! Pipeline definition documents
//!
//! A document is a YAML (or JSON) file with a top-level `pipelines` list.
//! Entries are parsed and validated one by one so a single bad definition is
//! reported and excluded without taking the rest of the file down with it.

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::Pipeline;
use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    pipelines: Vec<serde_yaml::Value>,
}

#[derive(Debug, Serialize)]
struct DocumentOut<'a> {
    pipelines: &'a [Pipeline],
}

/// Outcome of loading one entry of a document.
#[derive(Debug, Clone)]
pub struct LoadedEntry {
    /// Best-effort name; `<entry N>` when the entry has none.
    pub name: String,
    pub result: Result<Pipeline, ConfigError>,
}

/// Parse a whole document. Fails only when the document itself is unreadable.
pub fn parse_document(source: &str) -> Result<Vec<LoadedEntry>, ConfigError> {
    let raw: RawDocument =
        serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;

    Ok(raw
        .pipelines
        .into_iter()
        .enumerate()
        .map(|(index, value)| load_entry(index, value))
        .collect())
}

/// Parse and validate a single pipeline from a YAML or JSON value.
pub fn load_pipeline(value: serde_yaml::Value) -> Result<Pipeline, ConfigError> {
    let name = entry_name(&value).unwrap_or_default();
    let pipeline: Pipeline = serde_yaml::from_value(value).map_err(|e| {
        if name.is_empty() {
            ConfigError::Parse(e.to_string())
        } else {
            ConfigError::invalid(name.clone(), e.to_string())
        }
    })?;
    pipeline.validate()?;
    Ok(pipeline)
}

/// Same as [`load_pipeline`], for definitions stored as JSON.
pub fn load_pipeline_json(value: &serde_json::Value) -> Result<Pipeline, ConfigError> {
    let value = serde_yaml::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    load_pipeline(value)
}

/// Render pipelines back into a document.
pub fn render_document(pipelines: &[Pipeline]) -> Result<String, ConfigError> {
    serde_yaml::to_string(&DocumentOut { pipelines }).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn load_entry(index: usize, value: serde_yaml::Value) -> LoadedEntry {
    let name = entry_name(&value).unwrap_or_else(|| format!("<entry {index}>"));
    LoadedEntry {
        name,
        result: load_pipeline(value),
    }
}

fn entry_name(value: &serde_yaml::Value) -> Option<String> {
    value
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}
