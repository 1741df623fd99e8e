//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod instance;
mod pipeline;

pub use instance::InstanceCommands;
pub use pipeline::PipelineCommands;

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::OrchestratorClient;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Instance control
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },
    /// Check that the orchestrator is reachable
    Health,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Instance { command } => instance::handle_instance_command(command, config).await,
        Commands::Health => health(config).await,
    }
}

async fn health(config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);
    let status = client.health().await?;

    println!(
        "{} {} ({} pipeline(s))",
        "✓".green().bold(),
        config.orchestrator_url.cyan(),
        status["pipelines"]
    );

    Ok(())
}
