//! Pipeline command handlers
//!
//! Validates pipeline files locally and inspects, checks or triggers
//! pipelines on a running scheduler.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use openanomaly_client::{RemoteModelEngine, SchedulerClient};
use openanomaly_core::domain::job::{JobKind, PipelineSnapshot};
use openanomaly_core::domain::pipeline::{ModelKind, Pipeline};
use openanomaly_core::dto::pipeline::PipelineSummary;
use openanomaly_core::error::ConfigError;
use openanomaly_core::schema::{self, LoadedEntry};
use openanomaly_core::store::EnqueueOutcome;

use crate::config::Config;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Validate a pipeline file (YAML or JSON) without contacting the scheduler
    Validate {
        /// Path to the pipeline document
        file: String,
    },
    /// List registered pipelines
    List,
    /// Show a pipeline's definition and training state
    Show {
        /// Pipeline name
        name: String,
    },
    /// Enqueue an out-of-schedule job for the current step
    Trigger {
        /// Pipeline name
        name: String,

        /// Job kind: forecast, anomaly or train
        kind: JobKind,
    },
    /// Check that the pipeline's model server answers its health endpoint
    Check {
        /// Pipeline name
        name: String,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = SchedulerClient::new(&config.scheduler_url);

    match command {
        PipelineCommands::Validate { file } => validate_file(Path::new(&file)),
        PipelineCommands::List => list_pipelines(&client).await,
        PipelineCommands::Show { name } => show_pipeline(&client, &name).await,
        PipelineCommands::Trigger { name, kind } => trigger(&client, &name, kind).await,
        PipelineCommands::Check { name } => check_model(&client, &name).await,
    }
}

/// Read and parse a document; entries carry their own validation result
fn load_file(path: &Path) -> Result<Vec<LoadedEntry>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    let entries = schema::parse_document(&source)?;
    Ok(entries)
}

fn validate_file(path: &Path) -> Result<()> {
    let entries = load_file(path)?;

    if entries.is_empty() {
        println!("{}", "No pipelines defined.".yellow());
        return Ok(());
    }

    let mut first_error: Option<ConfigError> = None;
    for entry in &entries {
        match &entry.result {
            Ok(pipeline) => {
                println!(
                    "  {} {} {}",
                    "✓".green(),
                    entry.name.bold(),
                    format!("({}, {})", pipeline.mode, pipeline.model.describe()).dimmed()
                );
            }
            Err(e) => {
                println!("  {} {}", "✗".red(), entry.name.bold());
                println!("    {}", e.to_string().red());
                first_error.get_or_insert_with(|| e.clone());
            }
        }
    }

    match first_error {
        None => {
            println!(
                "{}",
                format!("✓ {} pipeline(s) valid", entries.len()).green().bold()
            );
            Ok(())
        }
        Some(e) => {
            let invalid = entries.iter().filter(|e| e.result.is_err()).count();
            Err::<(), _>(e).context(format!("{invalid} of {} pipeline(s) invalid", entries.len()))
        }
    }
}

async fn list_pipelines(client: &SchedulerClient) -> Result<()> {
    let pipelines = client
        .list_pipelines()
        .await
        .context("Failed to list pipelines")?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in &pipelines {
            print_pipeline_summary(pipeline);
        }
    }

    Ok(())
}

async fn show_pipeline(client: &SchedulerClient, name: &str) -> Result<()> {
    let detail = client
        .get_pipeline(name)
        .await
        .with_context(|| format!("Failed to fetch pipeline '{name}'"))?;

    match (&detail.snapshot, &detail.error) {
        (Some(snapshot), _) => print_pipeline_details(snapshot)?,
        (None, error) => {
            println!("{} {}", "Pipeline".bold(), detail.name.bold());
            println!(
                "  {} {}",
                "rejected:".red().bold(),
                error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

async fn trigger(client: &SchedulerClient, name: &str, kind: JobKind) -> Result<()> {
    let response = client
        .trigger(name, kind)
        .await
        .with_context(|| format!("Failed to trigger {kind} for '{name}'"))?;

    match response.outcome {
        EnqueueOutcome::Enqueued => {
            println!("{}", "✓ Job enqueued".green().bold());
        }
        EnqueueOutcome::Duplicate => {
            println!(
                "{}",
                "A job for this window already exists; nothing enqueued.".yellow()
            );
        }
        EnqueueOutcome::Fenced => {
            println!(
                "{}",
                "Rejected: the answering scheduler lost leadership.".yellow()
            );
        }
    }
    println!("  Job ID:     {}", response.job_id.to_string().cyan());
    println!("  Pipeline:   {}", response.pipeline.bold());
    println!("  Kind:       {}", response.kind);
    println!("  Due:        {}", response.due_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Visible at: {}",
        response.not_before.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Key:        {}", response.idempotency_key.to_string().dimmed());

    Ok(())
}

/// Best effort: an unhealthy model server is reported, not treated as an error
async fn check_model(client: &SchedulerClient, name: &str) -> Result<()> {
    let detail = client
        .get_pipeline(name)
        .await
        .with_context(|| format!("Failed to fetch pipeline '{name}'"))?;
    let Some(snapshot) = detail.snapshot else {
        println!("{}", "Pipeline is rejected; nothing to check.".yellow());
        return Ok(());
    };
    let pipeline = &snapshot.pipeline;

    let Some(endpoint) = remote_endpoint(pipeline) else {
        println!(
            "{} {} runs in-process; nothing to check.",
            "✓".green(),
            pipeline.model.describe()
        );
        return Ok(());
    };

    let engine = RemoteModelEngine::new(
        endpoint,
        pipeline.training.as_ref().and_then(|t| t.endpoint.clone()),
        pipeline.model.serialization_format,
        reqwest::Client::new(),
    );
    match engine.health().await {
        Ok(()) => println!("{} {} is healthy", "✓".green(), engine.endpoint().bold()),
        Err(e) => println!(
            "{} {} did not answer: {}",
            "✗".red(),
            engine.endpoint().bold(),
            e.to_string().yellow()
        ),
    }
    Ok(())
}

fn remote_endpoint(pipeline: &Pipeline) -> Option<&str> {
    match pipeline.model.kind {
        ModelKind::Remote => pipeline.model.endpoint.as_deref(),
        ModelKind::Local => None,
    }
}

fn print_pipeline_summary(pipeline: &PipelineSummary) {
    let marker = if !pipeline.valid {
        "✗".red()
    } else if pipeline.enabled {
        "▸".cyan()
    } else {
        "▸".dimmed()
    };
    println!("  {} {}", marker, pipeline.name.bold());

    if let Some(mode) = pipeline.mode {
        println!("    Mode:    {}", mode.to_string().dimmed());
    }
    if let Some(model) = &pipeline.model {
        println!("    Model:   {}", model.dimmed());
    }
    if !pipeline.enabled && pipeline.valid {
        println!("    {}", "disabled".yellow());
    }
    if let Some(error) = &pipeline.error {
        println!("    Error:   {}", error.red());
    }
    println!();
}

fn print_pipeline_details(snapshot: &PipelineSnapshot) -> Result<()> {
    let pipeline = &snapshot.pipeline;

    println!("{}", "Pipeline Details:".bold());
    println!("  Name:        {}", pipeline.name.bold());
    if !pipeline.description.is_empty() {
        println!("  Description: {}", pipeline.description);
    }
    println!("  Mode:        {}", pipeline.mode);
    println!("  Model:       {}", pipeline.model.describe().cyan());
    println!("  Enabled:     {}", pipeline.enabled);

    match &snapshot.artifact {
        Some(artifact) => {
            println!(
                "  Trained:     {} ({} .. {})",
                artifact.trained_at.format("%Y-%m-%d %H:%M:%S"),
                artifact.window_start.format("%Y-%m-%d %H:%M"),
                artifact.window_end.format("%Y-%m-%d %H:%M")
            );
            let parameters = serde_json::to_string(&artifact.parameters)
                .context("Failed to render artifact parameters")?;
            println!("  Fitted:      {}", parameters.dimmed());
        }
        None if pipeline.training_enabled() => {
            println!("  Trained:     {}", "not yet".yellow());
        }
        None => {}
    }

    let document = schema::render_document(std::slice::from_ref(pipeline))?;
    println!("\n{}", "Definition:".bold());
    println!("{}", "─".repeat(80).dimmed());
    print!("{}", document);
    println!("{}", "─".repeat(80).dimmed());

    Ok(())
}
