//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod leader;
mod pipeline;

pub use leader::LeaderCommands;
pub use pipeline::PipelineCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline definitions and manual triggers
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Scheduler leadership
    Leader {
        #[command(subcommand)]
        command: LeaderCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Leader { command } => leader::handle_leader_command(command, config).await,
    }
}
