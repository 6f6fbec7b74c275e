//! OpenAnomaly CLI
//!
//! Command-line interface for validating pipeline files and operating a
//! running scheduler.
//!
//! Exit codes: 0 success, 2 usage, 3 invalid configuration, 4 not found,
//! 5 scheduler unreachable, 6 API error, 1 anything else.

mod commands;
mod config;

use std::process::ExitCode;

use clap::Parser;
use colored::*;
use commands::{Commands, handle_command};
use config::Config;
use openanomaly_client::ClientError;
use openanomaly_core::error::ConfigError;

#[derive(Parser)]
#[command(name = "openanomaly")]
#[command(about = "OpenAnomaly forecasting and anomaly detection CLI", long_about = None)]
struct Cli {
    /// Scheduler URL
    #[arg(
        long,
        env = "OPENANOMALY_SCHEDULER_URL",
        default_value = "http://localhost:8080"
    )]
    scheduler_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with 2 from inside clap.
    let cli = Cli::parse();

    let config = Config {
        scheduler_url: cli.scheduler_url,
    };

    match handle_command(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map an error to the exit code of its failure class
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.chain().any(|e| e.downcast_ref::<ConfigError>().is_some()) {
        return 3;
    }
    match err.chain().find_map(|e| e.downcast_ref::<ClientError>()) {
        Some(e) if e.is_not_found() => 4,
        Some(ClientError::RequestFailed(_)) => 5,
        Some(ClientError::ApiError { .. }) => 6,
        _ => 1,
    }
}
