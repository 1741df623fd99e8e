//! Stage Engine
//!
//! Expands a stage's task into its job fan-out, submits the jobs, turns raw
//! executor statuses into [`JobPhase`]s and decides whether the stage is
//! still running, done, or failed.

use conduit_core::domain::instance::{InstanceState, PipelineInstance, StageCounts};
use conduit_core::domain::job::{
    CONDITION_COMPLETE, CONDITION_FAILED, CONDITION_SUBMIT_FAILED, JobCondition, JobHandle,
    JobPhase, JobStatus, RawJobStatus,
};
use conduit_core::domain::pipeline::{JobSlot, JobTemplate, PipelineSpec, ServiceSpec, Task};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use super::pipeline::hash_config;
use crate::executor::{
    JobExecutor, JobSubmission, LABEL_INSTANCE, LABEL_JOB, LABEL_PIPELINE, LABEL_TASK,
    ServiceSubmission,
};

/// Longest name a Kubernetes object label accepts
pub const MAX_NAME_LEN: usize = 63;

/// Hex digits of the hash suffix appended to shortened names
const NAME_HASH_LEN: usize = 8;

/// Stage engine errors
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {stage} does not exist (pipeline has {count} stages)")]
    InvalidStage { stage: usize, count: usize },

    #[error("no job of stage {stage} matches the filter")]
    EmptySelection { stage: usize },
}

pub type Result<T> = std::result::Result<T, StageError>;

/// Include/exclude selection of a stage's jobs
///
/// A non-empty include set limits the selection to the listed names; the
/// exclude set is removed either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl JobFilter {
    /// Selects every job
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(
        include: impl IntoIterator<Item = String>,
        exclude: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    pub fn admits(&self, job_name: &str) -> bool {
        (self.include.is_empty() || self.include.contains(job_name))
            && !self.exclude.contains(job_name)
    }
}

/// Where a stage stands after its statuses were aggregated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Some jobs are still running
    InProgress,
    /// Every job is terminal; `failed` counts the tolerated failures
    Completed { failed: usize },
    /// A job failed and the task does not continue on failure
    Failed { reason: String },
}

// =============================================================================
// Submission
// =============================================================================

/// Submits the selected jobs of `stage` and makes them the evaluated stage
///
/// The task's services are exposed first; a service the executor refuses is
/// logged and does not stop the stage. Every selected job gets an entry; jobs
/// the executor refuses are recorded as failed. The instance is left
/// `Running`.
pub async fn advance_stage(
    executor: &dyn JobExecutor,
    pipeline: &str,
    spec: &PipelineSpec,
    instance: &mut PipelineInstance,
    stage: usize,
    filter: &JobFilter,
) -> Result<()> {
    let task = spec.task(stage).ok_or(StageError::InvalidStage {
        stage,
        count: spec.stage_count(),
    })?;

    let slots: Vec<JobSlot<'_>> = task
        .fan_out()
        .into_iter()
        .filter(|slot| filter.admits(slot.name))
        .collect();

    if slots.is_empty() {
        return Err(StageError::EmptySelection { stage });
    }

    for service in &task.services {
        let submission = render_service(pipeline, spec, instance.id, task, service);
        if let Err(e) = executor.expose(&submission).await {
            tracing::warn!(
                "Exposing service {} of {}:{} failed: {}",
                service.name,
                pipeline,
                instance.id,
                e
            );
        }
    }

    let mut jobs = Vec::with_capacity(slots.len());
    for slot in slots {
        let submission =
            render_job(pipeline, spec, instance.id, instance.attempt, task, slot);
        match executor.submit(&submission).await {
            Ok(handle) => {
                tracing::info!(
                    "Submitted job {} of {}:{} stage {} as {}",
                    slot.name,
                    pipeline,
                    instance.id,
                    stage,
                    handle
                );
                jobs.push(JobStatus::submitted(slot.name, handle));
            }
            Err(e) => {
                tracing::warn!(
                    "Submission of job {} of {}:{} failed: {}",
                    slot.name,
                    pipeline,
                    instance.id,
                    e
                );
                jobs.push(JobStatus::submit_failed(slot.name, e.to_string()));
            }
        }
    }

    instance.jobs_stage = stage;
    instance.jobs_status = jobs;
    instance.current = StageCounts::from_jobs(&instance.jobs_status);
    instance.state = InstanceState::Running;
    instance.touch();

    Ok(())
}

/// Renders one fan-out slot into an executor submission
pub fn render_job(
    pipeline: &str,
    spec: &PipelineSpec,
    instance_id: u64,
    attempt: u32,
    task: &Task,
    slot: JobSlot<'_>,
) -> JobSubmission {
    let vars = [
        ("pipeline.name", pipeline.to_string()),
        ("pipeline.namespace", spec.namespace.clone()),
        ("pipeline.id", instance_id.to_string()),
        ("pipeline.workdir", spec.work_dir(instance_id)),
        ("task.name", task.name.clone()),
        ("job.name", slot.name.to_string()),
    ];

    let template: &JobTemplate = slot.template;

    let mut labels = stage_labels(pipeline, instance_id, task);
    labels.insert(LABEL_JOB.to_string(), slot.name.to_string());

    JobSubmission {
        name: executor_job_name(pipeline, instance_id, attempt, slot.name),
        job_name: slot.name.to_string(),
        namespace: spec.namespace.clone(),
        image: template.image.clone(),
        args: template.args.iter().map(|a| expand(a, &vars)).collect(),
        env: template
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v, &vars)))
            .collect(),
        completions: template.instances(),
        parallelism: template.parallelism(),
        labels,
        extra: template.extra.clone(),
    }
}

/// Renders a task service selecting the stage's pods, or one job's pods
fn render_service(
    pipeline: &str,
    spec: &PipelineSpec,
    instance_id: u64,
    task: &Task,
    service: &ServiceSpec,
) -> ServiceSubmission {
    let labels = stage_labels(pipeline, instance_id, task);
    let mut selector = labels.clone();
    if let Some(job) = &service.job {
        selector.insert(LABEL_JOB.to_string(), job.clone());
    }

    ServiceSubmission {
        name: dns_label(&format!("{}-{}-{}", pipeline, instance_id, service.name)),
        namespace: spec.namespace.clone(),
        ports: service
            .ports
            .iter()
            .map(|p| (p.name.clone(), p.port))
            .collect(),
        selector,
        labels,
    }
}

fn stage_labels(pipeline: &str, instance_id: u64, task: &Task) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PIPELINE.to_string(), pipeline.to_string()),
        (LABEL_INSTANCE.to_string(), instance_id.to_string()),
        (LABEL_TASK.to_string(), task.name.clone()),
    ])
}

/// Executor-level job name: `<pipeline>-<id>-<job>`
///
/// Restarted stages get `-r<attempt>` after the id so a re-run never reuses
/// the name of a job the executor still remembers.
pub fn executor_job_name(
    pipeline: &str,
    instance_id: u64,
    attempt: u32,
    job_name: &str,
) -> String {
    let raw = if attempt == 0 {
        format!("{}-{}-{}", pipeline, instance_id, job_name)
    } else {
        format!("{}-{}-r{}-{}", pipeline, instance_id, attempt, job_name)
    };
    dns_label(&raw)
}

/// Turns `raw` into a lower-case DNS label of at most [`MAX_NAME_LEN`] bytes
///
/// Longer names keep their prefix and end in a hash of the full name, so two
/// names sharing a long prefix stay distinct.
pub fn dns_label(raw: &str) -> String {
    let label: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');

    if label.len() <= MAX_NAME_LEN {
        return label.to_string();
    }

    let digest = hash_config(raw.as_bytes());
    let prefix = label[..MAX_NAME_LEN - NAME_HASH_LEN - 1].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..NAME_HASH_LEN])
}

/// Expands `{{key}}` placeholders; unknown placeholders are left as they are
fn expand(input: &str, vars: &[(&str, String)]) -> String {
    let mut output = input.to_string();
    for (key, value) in vars {
        output = output
            .replace(&format!("{{{{{}}}}}", key), value)
            .replace(&format!("{{{{ {} }}}}", key), value);
    }
    output
}

// =============================================================================
// Ingestion
// =============================================================================

/// Interprets a raw executor status
///
/// A job whose failed pods exceed its failure threshold is failed even while
/// pods are still active. Otherwise active pods mean running, and the most
/// recent terminal condition decides; equally recent conditions resolve to
/// failure.
pub fn derive_phase(raw: &RawJobStatus, template: Option<&JobTemplate>) -> JobPhase {
    let threshold = template
        .map(JobTemplate::failure_threshold)
        .unwrap_or_else(|| JobTemplate::default().failure_threshold());

    if raw.failed > threshold {
        return JobPhase::Failed {
            reason: format!("too many failures ({})", raw.failed),
        };
    }

    if raw.active > 0 {
        return JobPhase::Running;
    }

    if let Some(condition) = latest_terminal_condition(&raw.conditions) {
        if condition.kind == CONDITION_COMPLETE {
            return JobPhase::Succeeded;
        }
        return JobPhase::Failed {
            reason: condition
                .reason
                .clone()
                .or_else(|| condition.message.clone())
                .unwrap_or_else(|| condition.kind.clone()),
        };
    }

    if raw.failed > 0 {
        return JobPhase::Failed {
            reason: format!("{} pod(s) failed", raw.failed),
        };
    }

    JobPhase::Running
}

fn latest_terminal_condition(conditions: &[JobCondition]) -> Option<&JobCondition> {
    conditions
        .iter()
        .filter(|c| c.holds())
        .filter(|c| {
            matches!(
                c.kind.as_str(),
                CONDITION_COMPLETE | CONDITION_FAILED | CONDITION_SUBMIT_FAILED
            )
        })
        // None sorts first, so undated conditions lose to dated ones
        .max_by(|a, b| {
            a.last_transition_time
                .cmp(&b.last_transition_time)
                .then_with(|| severity(a).cmp(&severity(b)))
        })
}

fn severity(condition: &JobCondition) -> u8 {
    if condition.kind == CONDITION_COMPLETE {
        0
    } else {
        1
    }
}

/// Records a raw status for one job of the evaluated stage
///
/// Returns `false` when the job is not part of the stage, or when `handle`
/// does not match the tracked submission. Terminal phases are sticky, so a
/// stale reading delivered late cannot revive a finished job.
pub fn apply_status(
    task: &Task,
    instance: &mut PipelineInstance,
    job_name: &str,
    handle: Option<&JobHandle>,
    raw: RawJobStatus,
) -> bool {
    let Some(entry) = instance
        .jobs_status
        .iter_mut()
        .find(|j| j.job_name == job_name)
    else {
        return false;
    };

    if handle.is_some_and(|h| entry.handle.as_ref() != Some(h)) {
        return false;
    }

    if entry.handle.is_none() {
        // never reached the executor
        return false;
    }

    let phase = derive_phase(&raw, task.job(job_name));
    if entry.phase.is_terminal() && !phase.is_terminal() {
        return false;
    }

    entry.active = raw.active;
    entry.succeeded = raw.succeeded;
    entry.failed = raw.failed;
    entry.conditions = raw.conditions;
    entry.phase = phase;

    instance.current = StageCounts::from_jobs(&instance.jobs_status);
    instance.touch();
    true
}

/// Decides the outcome of a stage from its job entries
pub fn outcome(task: &Task, jobs: &[JobStatus]) -> StageOutcome {
    if !task.continue_on_failure {
        let first_failure = jobs.iter().find_map(|j| match &j.phase {
            JobPhase::Failed { reason } => Some((j, reason)),
            _ => None,
        });
        if let Some((job, reason)) = first_failure {
            return StageOutcome::Failed {
                reason: format!("job {} failed: {}", job.job_name, reason),
            };
        }
    }

    if jobs.iter().any(|j| !j.phase.is_terminal()) {
        return StageOutcome::InProgress;
    }

    StageOutcome::Completed {
        failed: jobs.iter().filter(|j| j.phase.is_failed()).count(),
    }
}
