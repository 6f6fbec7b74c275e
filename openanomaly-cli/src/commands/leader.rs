//! Leadership command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use openanomaly_client::SchedulerClient;
use openanomaly_core::domain::lease::Leadership;
use openanomaly_core::dto::leader::LeaderStatus;

use crate::config::Config;

/// Leader subcommands
#[derive(Subcommand)]
pub enum LeaderCommands {
    /// Show the answering instance's role and the current lease
    Status,
}

pub async fn handle_leader_command(command: LeaderCommands, config: &Config) -> Result<()> {
    let client = SchedulerClient::new(&config.scheduler_url);

    match command {
        LeaderCommands::Status => {
            let status = client
                .leader_status()
                .await
                .context("Failed to fetch leader status")?;
            print_leader_status(&status);
            Ok(())
        }
    }
}

fn print_leader_status(status: &LeaderStatus) {
    println!("{}", "Leadership:".bold());
    println!("  Instance: {}", status.instance_id.cyan());
    match status.leadership {
        Leadership::Active { fencing_token } => {
            println!("  Role:     {}", "active".green().bold());
            println!("  Token:    {}", fencing_token);
        }
        Leadership::Standby => println!("  Role:     {}", "standby".yellow()),
    }

    match &status.lease {
        Some(lease) => {
            println!("  Leader:   {}", lease.holder_id.bold());
            println!("  Fencing:  {}", lease.fencing_token.to_string().dimmed());
            println!(
                "  Expires:  {}",
                lease.expires_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
            );
        }
        None => println!("  Leader:   {}", "none (lease vacant)".yellow()),
    }
}
