//! Instance command handlers
//!
//! Starts, restarts, stops, clones and deletes pipeline instances, and pushes
//! job statuses for executors that report instead of being polled.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::OrchestratorClient;
use conduit_core::domain::instance::{InstanceState, PipelineInstance, StageCounts};
use conduit_core::domain::job::{JobPhase, RawJobStatus};
use conduit_core::domain::pipeline::PipelineSpec;
use conduit_core::dto::instance::CloneRequest;

use crate::config::Config;

/// Instance subcommands
#[derive(Subcommand)]
pub enum InstanceCommands {
    /// Start a new instance at the first stage
    Start {
        /// Pipeline name
        pipeline: String,
    },
    /// Restart an instance at a given stage
    Restart {
        /// Pipeline name
        pipeline: String,

        /// Instance id
        id: u64,

        /// Stage to restart at
        #[arg(short, long, default_value = "0")]
        stage: usize,
    },
    /// Stop a running instance
    Stop {
        /// Pipeline name
        pipeline: String,

        /// Instance id
        id: u64,
    },
    /// Clone an instance, re-running its stage with a subset of jobs
    Clone {
        /// Pipeline name
        pipeline: String,

        /// Source instance id
        id: u64,

        /// Jobs to re-run (comma-separated); all when omitted
        #[arg(short, long, value_delimiter = ',')]
        include: Vec<String>,

        /// Jobs to leave out (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// Delete an instance
    Delete {
        /// Pipeline name
        pipeline: String,

        /// Instance id
        id: u64,
    },
    /// Push the status of one job
    Report {
        /// Pipeline name
        pipeline: String,

        /// Instance id
        id: u64,

        /// Job name
        job: String,

        #[arg(long, default_value = "0")]
        active: u32,

        #[arg(long, default_value = "0")]
        succeeded: u32,

        #[arg(long, default_value = "0")]
        failed: u32,
    },
}

/// Handle instance commands
pub async fn handle_instance_command(command: InstanceCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    let instance = match command {
        InstanceCommands::Start { pipeline } => client.start_instance(&pipeline).await?,
        InstanceCommands::Restart {
            pipeline,
            id,
            stage,
        } => client.restart_stage(&pipeline, id, stage).await?,
        InstanceCommands::Stop { pipeline, id } => client.stop_instance(&pipeline, id).await?,
        InstanceCommands::Clone {
            pipeline,
            id,
            include,
            exclude,
        } => {
            client
                .clone_instance(CloneRequest {
                    pipeline,
                    instance: id,
                    include,
                    exclude,
                })
                .await?
        }
        InstanceCommands::Delete { pipeline, id } => {
            client.delete_instance(&pipeline, id).await?;
            println!(
                "{}",
                format!("✓ Instance {}:{} deleted", pipeline, id)
                    .green()
                    .bold()
            );
            return Ok(());
        }
        InstanceCommands::Report {
            pipeline,
            id,
            job,
            active,
            succeeded,
            failed,
        } => {
            let status = RawJobStatus {
                active,
                succeeded,
                failed,
                conditions: Vec::new(),
            };
            client.report_status(&pipeline, id, &job, status).await?
        }
    };

    print_instance(&instance);

    Ok(())
}

/// Print an instance with every tracked job
fn print_instance(instance: &PipelineInstance) {
    println!(
        "{} {} {}",
        "Instance".bold(),
        instance.id.to_string().cyan(),
        colored_state(instance.state)
    );
    println!("  Stage:   {}", instance.stage);
    println!("  Jobs:    {}", format_counts(&instance.current));
    if let Some(source) = instance.cloned_from {
        println!("  Clone of: {}", source);
    }
    if let Some(message) = &instance.message {
        println!("  Message: {}", message.red());
    }
    for job in &instance.jobs_status {
        let phase = match &job.phase {
            JobPhase::Running => job.phase.to_string().yellow(),
            JobPhase::Succeeded => job.phase.to_string().green(),
            JobPhase::Failed { .. } => job.phase.to_string().red(),
        };
        println!("    {} {} {}", "▸".cyan(), job.job_name, phase);
    }
}

/// Print a one-line summary of an instance, naming its stage
pub(crate) fn print_instance_summary(instance: &PipelineInstance, spec: &PipelineSpec) {
    let stage = spec
        .task(instance.stage)
        .map(|task| task.name.as_str())
        .unwrap_or("?");
    println!(
        "  {} {:<4} {:<10} stage {} ({}) {}",
        "▸".cyan(),
        instance.id,
        colored_state(instance.state),
        instance.stage,
        stage,
        format_counts(&instance.current).dimmed()
    );
}

fn colored_state(state: InstanceState) -> ColoredString {
    match state {
        InstanceState::Pending => "Pending".dimmed(),
        InstanceState::Running => "Running".yellow(),
        InstanceState::Succeeded => "Succeeded".green(),
        InstanceState::Failed => "Failed".red(),
    }
}

fn format_counts(counts: &StageCounts) -> String {
    format!(
        "{} running, {} succeeded, {} failed",
        counts.running, counts.success, counts.failed
    )
}
