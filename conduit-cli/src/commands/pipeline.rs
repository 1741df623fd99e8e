//! Pipeline command handlers
//!
//! Handles pipeline registration, listing, inspection, reload and deletion.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::OrchestratorClient;
use conduit_core::domain::pipeline::{PipelineSpec, PipelineState};
use conduit_core::dto::pipeline::{CreatePipeline, ListPipelines, PipelineSummary};

use crate::commands::instance::print_instance_summary;
use crate::config::Config;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Register a pipeline from a configuration URI
    Create {
        /// Pipeline name
        #[arg(short, long)]
        name: String,

        /// Configuration location (file path, file:// or http(s):// URI)
        #[arg(short, long)]
        uri: String,
    },
    /// List pipelines
    List {
        /// Only pipelines whose name matches this regular expression
        #[arg(short, long)]
        pattern: Option<String>,

        /// Index of the first pipeline to show
        #[arg(long)]
        start: Option<usize>,

        /// Maximum number of pipelines to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count pipelines
    Count {
        /// Only pipelines whose name matches this regular expression
        #[arg(short, long)]
        pattern: Option<String>,
    },
    /// Get pipeline details and instances
    Get {
        /// Pipeline name
        name: String,
    },
    /// Reload a pipeline's configuration from its URI
    Reload {
        /// Pipeline name
        name: String,
    },
    /// Delete a pipeline
    Delete {
        /// Pipeline name
        name: String,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        PipelineCommands::Create { name, uri } => create_pipeline(&client, name, uri).await,
        PipelineCommands::List {
            pattern,
            start,
            limit,
        } => {
            let query = ListPipelines {
                pattern,
                start,
                limit,
            };
            list_pipelines(&client, &query).await
        }
        PipelineCommands::Count { pattern } => {
            let count = client.count_pipelines(pattern.as_deref()).await?;
            println!("{}", count);
            Ok(())
        }
        PipelineCommands::Get { name } => get_pipeline(&client, &name).await,
        PipelineCommands::Reload { name } => reload_pipeline(&client, &name).await,
        PipelineCommands::Delete { name } => delete_pipeline(&client, &name).await,
    }
}

async fn create_pipeline(client: &OrchestratorClient, name: String, uri: String) -> Result<()> {
    let pipeline = client.create_pipeline(CreatePipeline { name, uri }).await?;

    println!("{}", "✓ Pipeline created successfully!".green().bold());
    println!("  Name:   {}", pipeline.name.bold());
    println!("  URI:    {}", pipeline.uri.dimmed());
    println!("  Hash:   {}", pipeline.config.hash.dimmed());
    println!("  Stages: {}", stage_names(&pipeline.config.spec).dimmed());

    Ok(())
}

async fn list_pipelines(client: &OrchestratorClient, query: &ListPipelines) -> Result<()> {
    let pipelines = client.list_pipelines(query).await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

async fn get_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    let detail = client.get_pipeline(name).await?;
    let spec = &detail.config.spec;

    println!("{}", "Pipeline Details:".bold());
    println!("  Name:      {}", detail.name.bold());
    println!("  URI:       {}", detail.uri);
    println!("  Hash:      {}", detail.config.hash.dimmed());
    println!("  State:     {}", colored_state(detail.state));
    if !spec.namespace.is_empty() {
        println!("  Namespace: {}", spec.namespace);
    }
    if !spec.storage.is_empty() {
        println!("  Storage:   {}", spec.storage);
    }
    if let Some(next_run) = detail.next_run {
        println!("  Next run:  {}", next_run.format("%Y-%m-%d %H:%M"));
    }

    println!("\n{}", "Stages:".bold());
    for (index, task) in spec.tasks.iter().enumerate() {
        println!(
            "  {} {} ({} job(s){})",
            format!("{}.", index).dimmed(),
            task.name.cyan(),
            task.fan_out_count(),
            if task.continue_on_failure {
                ", continues on failure"
            } else {
                ""
            }
        );
    }

    println!("\n{}", "Instances:".bold());
    if detail.instances.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for instance in &detail.instances {
        print_instance_summary(instance, spec);
    }

    Ok(())
}

async fn reload_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    let pipeline = client.reload_pipeline(name).await?;

    println!(
        "{}",
        format!("✓ Pipeline {} reloaded", pipeline.name).green().bold()
    );
    println!("  Hash:   {}", pipeline.config.hash.dimmed());
    println!("  Stages: {}", stage_names(&pipeline.config.spec).dimmed());

    Ok(())
}

async fn delete_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    client.delete_pipeline(name).await?;

    println!(
        "{}",
        format!("✓ Pipeline {} deleted successfully!", name)
            .green()
            .bold()
    );

    Ok(())
}

fn print_pipeline_summary(pipeline: &PipelineSummary) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        pipeline.name.bold(),
        colored_state(pipeline.state)
    );
    println!("    Stages: {}", stage_names(&pipeline.spec).dimmed());
    println!();
}

fn colored_state(state: PipelineState) -> ColoredString {
    match state {
        PipelineState::Running => "Running".yellow(),
        PipelineState::Stopped => "Stopped".dimmed(),
    }
}

/// Stage names joined in execution order
fn stage_names(spec: &PipelineSpec) -> String {
    spec.tasks
        .iter()
        .map(|task| task.name.as_str())
        .collect::<Vec<_>>()
        .join(" → ")
}
