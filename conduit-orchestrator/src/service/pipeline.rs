//! Pipeline Service
//!
//! Spec store operations: loading pipeline configurations from their URI,
//! validating and hashing them, and registering, reloading, listing and
//! deleting pipelines.

use chrono::Utc;
use conduit_core::domain::pipeline::{
    Pipeline, PipelineConfig, PipelineSpec, PipelineState, Task,
};
use conduit_core::dto::pipeline::{CreatePipeline, ListPipelines, PipelineDetail, PipelineSummary};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::service::scheduler::{self, CronSchedule};
use crate::service::stage::MAX_NAME_LEN;
use crate::state::AppState;
use crate::store::PipelineEntry;

/// Service error type
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline {0} not found")]
    NotFound(String),

    #[error("pipeline {0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    ValidationError(String),

    #[error("cannot load configuration from {uri}: {reason}")]
    LoadError { uri: String, reason: String },

    #[error("pipeline {0} has running instances")]
    Running(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Register a new pipeline from its configuration URI
pub async fn create_pipeline(state: &AppState, req: CreatePipeline) -> Result<Pipeline> {
    validate_pipeline_request(&req)?;

    if state.store.get(&req.name).is_some() {
        return Err(PipelineError::AlreadyExists(req.name));
    }

    let config = load_config(&req.uri).await?;
    let pipeline = Pipeline {
        name: req.name.clone(),
        uri: req.uri,
        config,
    };

    let entry = state
        .store
        .insert(pipeline)
        .ok_or_else(|| PipelineError::AlreadyExists(req.name))?;

    tracing::info!(
        "Pipeline created: {} ({} stages, hash {})",
        entry.name(),
        entry.config().spec.stage_count(),
        entry.config().hash
    );

    Ok(entry.pipeline())
}

/// Get a pipeline with its instances
pub fn get_pipeline(state: &AppState, name: &str) -> Result<PipelineDetail> {
    let entry = find_pipeline(state, name)?;
    let config = entry.config();
    let instances = entry.instances();

    Ok(PipelineDetail {
        name: entry.name().to_string(),
        uri: entry.uri().to_string(),
        state: derived_state(&entry),
        next_run: scheduler::next_run(config.spec.schedule.as_ref(), Utc::now()),
        config: config.as_ref().clone(),
        instances,
    })
}

/// List pipelines in name order, filtered by a name regex and paged
pub fn list_pipelines(state: &AppState, query: &ListPipelines) -> Result<Vec<PipelineSummary>> {
    let pipelines = matching(state, query.pattern.as_deref())?
        .skip(query.start.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|entry| PipelineSummary {
            name: entry.name().to_string(),
            spec: entry.config().spec.clone(),
            state: derived_state(&entry),
        })
        .collect();
    Ok(pipelines)
}

/// Count pipelines whose name matches `pattern`
pub fn count_pipelines(state: &AppState, pattern: Option<&str>) -> Result<usize> {
    Ok(matching(state, pattern)?.count())
}

/// Reload a pipeline's configuration from its URI
///
/// Refused while instances are running; the stored spec is left untouched
/// when the new configuration is invalid.
pub async fn reload_pipeline(state: &AppState, name: &str) -> Result<Pipeline> {
    let entry = find_pipeline(state, name)?;

    if entry.has_running_instances() {
        return Err(PipelineError::Running(name.to_string()));
    }

    let config = load_config(entry.uri()).await?;
    let changed = config.hash != entry.config().hash;
    entry.set_config(config);

    if changed {
        tracing::info!("Pipeline {} reloaded with a new configuration", name);
    } else {
        tracing::debug!("Pipeline {} reloaded, configuration unchanged", name);
    }

    Ok(entry.pipeline())
}

/// Delete a pipeline and all of its instances
pub fn delete_pipeline(state: &AppState, name: &str) -> Result<()> {
    let entry = find_pipeline(state, name)?;

    if entry.has_running_instances() {
        return Err(PipelineError::Running(name.to_string()));
    }

    state.store.remove(name);

    tracing::info!(
        "Pipeline deleted: {} ({} instances)",
        name,
        entry.instances().len()
    );

    Ok(())
}

fn find_pipeline(state: &AppState, name: &str) -> Result<Arc<PipelineEntry>> {
    state
        .store
        .get(name)
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))
}

/// Pipelines whose name matches `pattern` anywhere; all when it is blank
fn matching(
    state: &AppState,
    pattern: Option<&str>,
) -> Result<impl Iterator<Item = Arc<PipelineEntry>>> {
    let regex = pattern
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p).map_err(|e| {
                PipelineError::ValidationError(format!("Invalid name pattern '{}': {}", p, e))
            })
        })
        .transpose()?;

    Ok(state
        .store
        .entries()
        .into_iter()
        .filter(move |entry| regex.as_ref().is_none_or(|r| r.is_match(entry.name()))))
}

fn derived_state(entry: &PipelineEntry) -> PipelineState {
    if entry.has_running_instances() {
        PipelineState::Running
    } else {
        PipelineState::Stopped
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Fetch, parse, validate and hash a configuration
pub async fn load_config(uri: &str) -> Result<PipelineConfig> {
    let bytes = fetch(uri).await.map_err(|reason| PipelineError::LoadError {
        uri: uri.to_string(),
        reason,
    })?;

    let spec = parse_spec(&bytes)?;
    validate_spec(&spec)?;

    Ok(PipelineConfig {
        hash: hash_config(&bytes),
        spec,
    })
}

async fn fetch(uri: &str) -> std::result::Result<Vec<u8>, String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri).await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        return Ok(body.to_vec());
    }

    let path = uri.strip_prefix("file://").unwrap_or(uri);
    if path.is_empty() || (uri.contains("://") && !uri.starts_with("file://")) {
        return Err("unsupported URI".to_string());
    }

    tokio::fs::read(path).await.map_err(|e| e.to_string())
}

/// Parse a YAML or JSON configuration
pub fn parse_spec(bytes: &[u8]) -> Result<PipelineSpec> {
    serde_yaml::from_slice(bytes)
        .map_err(|e| PipelineError::ValidationError(format!("Invalid pipeline spec: {}", e)))
}

/// Hex SHA-256 of the raw configuration bytes
pub fn hash_config(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline name cannot be empty".to_string(),
        ));
    }

    // the name is also a label value on every executor object
    if req.name.len() > MAX_NAME_LEN {
        return Err(PipelineError::ValidationError(format!(
            "Pipeline name is too long (max {} characters)",
            MAX_NAME_LEN
        )));
    }

    if !req
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PipelineError::ValidationError(
            "Pipeline name may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }

    let edges_alphanumeric = req.name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && req.name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !edges_alphanumeric {
        return Err(PipelineError::ValidationError(
            "Pipeline name must start and end with a letter or digit".to_string(),
        ));
    }

    if req.uri.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline uri cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Check the structural rules of a spec
pub fn validate_spec(spec: &PipelineSpec) -> Result<()> {
    let invalid = |msg: String| Err(PipelineError::ValidationError(msg));

    if spec.tasks.is_empty() {
        return invalid("Pipeline must have at least one task".to_string());
    }

    let mut task_names = HashSet::new();
    for (stage, task) in spec.tasks.iter().enumerate() {
        if task.name.trim().is_empty() {
            return invalid(format!("Task {} has no name", stage));
        }
        if !task_names.insert(task.name.as_str()) {
            return invalid(format!("Duplicate task name '{}'", task.name));
        }
        if !is_label_value(&task.name) {
            return invalid(format!("Invalid task name '{}'", task.name));
        }

        match (&task.template, task.jobs.is_empty()) {
            (Some(_), false) => {
                return invalid(format!(
                    "Task '{}' sets both template and jobs",
                    task.name
                ));
            }
            (None, true) => {
                return invalid(format!("Task '{}' has no job", task.name));
            }
            _ => {}
        }

        let mut job_names = HashSet::new();
        for template in &task.jobs {
            let Some(job) = template.job.as_deref().filter(|j| !j.trim().is_empty()) else {
                return invalid(format!("Task '{}' has a job without a name", task.name));
            };
            if !job_names.insert(job) {
                return invalid(format!(
                    "Duplicate job name '{}' in task '{}'",
                    job, task.name
                ));
            }
        }

        validate_services(task)?;

        for slot in task.fan_out() {
            if !is_label_value(slot.name) {
                return invalid(format!("Invalid job name '{}'", slot.name));
            }
            let template = slot.template;
            if template.image.trim().is_empty() {
                return invalid(format!("Job '{}' has no image", slot.name));
            }
            if template.instances == Some(0) {
                return invalid(format!("Job '{}' must run at least one instance", slot.name));
            }
            if template.parallelism() > template.instances() {
                return invalid(format!(
                    "Job '{}' has parallelism {} above its {} instances",
                    slot.name,
                    template.parallelism(),
                    template.instances()
                ));
            }
        }
    }

    if let Some(schedule) = &spec.schedule {
        CronSchedule::parse(schedule)
            .map_err(|e| PipelineError::ValidationError(e.to_string()))?;
    }

    Ok(())
}

/// Names that are also label values: at most 63 characters of `[A-Za-z0-9_.-]`,
/// alphanumeric at both ends
fn is_label_value(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn validate_services(task: &Task) -> Result<()> {
    let invalid = |msg: String| Err(PipelineError::ValidationError(msg));

    let mut names = HashSet::new();
    for service in &task.services {
        if service.name.trim().is_empty() {
            return invalid(format!("Task '{}' has a service without a name", task.name));
        }
        if !names.insert(service.name.as_str()) {
            return invalid(format!(
                "Duplicate service name '{}' in task '{}'",
                service.name, task.name
            ));
        }
        if let Some(job) = &service.job {
            if !task.fan_out().iter().any(|slot| slot.name == job.as_str()) {
                return invalid(format!(
                    "Unknown job '{}' in service '{}'",
                    job, service.name
                ));
            }
        }
        if service.ports.is_empty() {
            return invalid(format!("Service '{}' has no port", service.name));
        }
        for port in &service.ports {
            if port.name.trim().is_empty() {
                return invalid(format!("Service '{}' has a port without a name", service.name));
            }
            if port.port == 0 {
                return invalid(format!("Service '{}' has an invalid port", service.name));
            }
        }
    }

    Ok(())
}
