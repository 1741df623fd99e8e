//! Instance Service
//!
//! Owns the lifecycle of pipeline instances: start, stage restart, clone,
//! stop and delete, plus the evaluation step that advances an instance once
//! its current stage settles.
//!
//! Every mutation runs under the instance's slot lock. Operator mutations use
//! `try_lock` and report a conflict when another operation holds the
//! instance; status ingestion waits its turn.

use conduit_core::domain::instance::{InstanceState, PipelineInstance, StageCounts};
use conduit_core::domain::job::{JobHandle, JobPhase, RawJobStatus};
use conduit_core::domain::pipeline::PipelineSpec;
use conduit_core::dto::instance::{CloneRequest, StatusReport};
use std::sync::Arc;
use thiserror::Error;

use crate::executor::JobExecutor;
use crate::service::stage::{self, JobFilter, StageError, StageOutcome};
use crate::service::workdir::{self, WorkDirError};
use crate::state::AppState;
use crate::store::{InstanceSlot, PipelineEntry, SlotError};

/// Message recorded on instances aborted by an operator
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Service error type
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("pipeline {0} not found")]
    PipelineNotFound(String),

    #[error("instance {id} of pipeline {pipeline} not found")]
    NotFound { pipeline: String, id: u64 },

    #[error("instance {0} is running")]
    Running(u64),

    #[error("instance {0} is not running")]
    NotRunning(u64),

    #[error("job {job} is not part of the current stage of instance {id}")]
    UnknownJob { id: u64, job: String },

    #[error("instance {id}: {reason}")]
    Conflict { id: u64, reason: SlotError },

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    WorkDir(#[from] WorkDirError),
}

pub type Result<T> = std::result::Result<T, InstanceError>;

/// Starts a new instance at stage 0
pub async fn start_instance(state: &AppState, pipeline: &str) -> Result<PipelineInstance> {
    let entry = find_pipeline(state, pipeline)?;
    let config = entry.config();

    check_selection(&config.spec, 0, &JobFilter::all())?;

    let id = entry.next_id();
    let slot = entry.insert_instance(PipelineInstance::new(id, 0));
    let mut guard = slot.lock().await.map_err(|reason| conflict(id, reason))?;

    stage::advance_stage(
        state.executor.as_ref(),
        pipeline,
        &config.spec,
        &mut guard,
        0,
        &JobFilter::all(),
    )
    .await?;
    evaluate(state.executor.as_ref(), pipeline, &config.spec, &mut guard).await;

    tracing::info!("Instance {}:{} started ({})", pipeline, id, guard.state);

    Ok(PipelineInstance::clone(&guard))
}

/// Re-runs one stage of a finished instance
///
/// Re-running the instance's own stage resumes normal progression. Re-running
/// any other stage is detached: the instance does not advance, and returns to
/// its previous state once the stage succeeds, or fails otherwise.
pub async fn restart_stage(
    state: &AppState,
    pipeline: &str,
    id: u64,
    stage: usize,
) -> Result<PipelineInstance> {
    let entry = find_pipeline(state, pipeline)?;
    let slot = find_slot(&entry, id)?;
    let mut guard = slot.try_lock().map_err(|reason| conflict(id, reason))?;

    if guard.is_running() {
        return Err(InstanceError::Running(id));
    }

    let config = entry.config();
    check_selection(&config.spec, stage, &JobFilter::all())?;

    let previous = guard.state;
    release_jobs(state.executor.as_ref(), &guard).await;
    guard.attempt += 1;
    stage::advance_stage(
        state.executor.as_ref(),
        pipeline,
        &config.spec,
        &mut guard,
        stage,
        &JobFilter::all(),
    )
    .await?;

    guard.message = None;
    if stage == guard.stage {
        guard.start_stage = stage;
        guard.resume_state = None;
    } else {
        guard.resume_state = Some(previous);
    }

    evaluate(state.executor.as_ref(), pipeline, &config.spec, &mut guard).await;

    tracing::info!(
        "Instance {}:{} restarted at stage {} ({})",
        pipeline,
        id,
        stage,
        guard.state
    );

    Ok(PipelineInstance::clone(&guard))
}

/// Creates a new instance re-running the source's stage with a job filter
///
/// The source's work directory is copied to the clone's first. The clone
/// continues through the following stages with their full fan-out.
pub async fn clone_instance(state: &AppState, req: CloneRequest) -> Result<PipelineInstance> {
    let entry = find_pipeline(state, &req.pipeline)?;
    let source = find_slot(&entry, req.instance)?.snapshot();
    let config = entry.config();

    let filter = JobFilter::new(req.include, req.exclude);
    check_selection(&config.spec, source.stage, &filter)?;

    let id = entry.next_id();
    workdir::copy_work_dir(&config.spec, source.id, id).await?;

    let mut instance = PipelineInstance::new(id, source.stage);
    instance.cloned_from = Some(source.id);

    let slot = entry.insert_instance(instance);
    let mut guard = slot.lock().await.map_err(|reason| conflict(id, reason))?;

    stage::advance_stage(
        state.executor.as_ref(),
        entry.name(),
        &config.spec,
        &mut guard,
        source.stage,
        &filter,
    )
    .await?;
    evaluate(state.executor.as_ref(), entry.name(), &config.spec, &mut guard).await;

    tracing::info!(
        "Instance {}:{} cloned from {} at stage {}",
        entry.name(),
        id,
        source.id,
        source.stage
    );

    Ok(PipelineInstance::clone(&guard))
}

/// Aborts a running instance and cancels its running jobs
pub async fn stop_instance(state: &AppState, pipeline: &str, id: u64) -> Result<PipelineInstance> {
    let entry = find_pipeline(state, pipeline)?;
    let slot = find_slot(&entry, id)?;
    let mut guard = slot.try_lock().map_err(|reason| conflict(id, reason))?;

    if !guard.is_running() {
        return Err(InstanceError::NotRunning(id));
    }

    cancel_running_jobs(state.executor.as_ref(), &mut guard, STOPPED_BY_USER).await;
    fail(&mut guard, STOPPED_BY_USER.to_string());

    tracing::info!("Instance {}:{} stopped by user", pipeline, id);

    Ok(PipelineInstance::clone(&guard))
}

/// Removes an instance; its in-flight jobs are left alone
pub async fn delete_instance(state: &AppState, pipeline: &str, id: u64) -> Result<()> {
    let entry = find_pipeline(state, pipeline)?;
    let slot = find_slot(&entry, id)?;

    let mut guard = slot.try_lock().map_err(|reason| conflict(id, reason))?;
    guard.mark_removed();
    drop(guard);

    entry.remove_instance(id);

    tracing::info!("Instance {}:{} deleted", pipeline, id);
    Ok(())
}

/// Ingests a status pushed for one job, then evaluates the instance
pub async fn report_status(
    state: &AppState,
    pipeline: &str,
    id: u64,
    report: StatusReport,
) -> Result<PipelineInstance> {
    let entry = find_pipeline(state, pipeline)?;
    let slot = find_slot(&entry, id)?;
    let mut guard = slot.lock().await.map_err(|reason| conflict(id, reason))?;

    if guard.job(&report.job).is_none() {
        return Err(InstanceError::UnknownJob {
            id,
            job: report.job,
        });
    }

    if !guard.is_running() {
        tracing::debug!(
            "Ignoring status of {} for finished instance {}:{}",
            report.job,
            pipeline,
            id
        );
        return Ok(PipelineInstance::clone(&guard));
    }

    let config = entry.config();
    if let Some(task) = config.spec.task(guard.jobs_stage) {
        stage::apply_status(task, &mut guard, &report.job, None, report.status);
    }
    evaluate(state.executor.as_ref(), pipeline, &config.spec, &mut guard).await;

    Ok(PipelineInstance::clone(&guard))
}

/// Polls the executor for every unfinished job of an instance
///
/// Executor calls happen before the instance is locked; readings are then
/// applied against the handles they were taken for. Unreachable jobs are
/// skipped until the next poll.
pub async fn refresh_instance(state: &AppState, pipeline: &str, id: u64) -> Result<bool> {
    let entry = find_pipeline(state, pipeline)?;
    let slot = find_slot(&entry, id)?;

    // pending instances are still being submitted by their creator
    let snapshot = slot.snapshot();
    if snapshot.state != InstanceState::Running {
        return Ok(false);
    }

    let readings = poll_jobs(state.executor.as_ref(), pipeline, &snapshot).await;

    let mut guard = slot.lock().await.map_err(|reason| conflict(id, reason))?;
    if guard.state != InstanceState::Running {
        return Ok(false);
    }

    let config = entry.config();
    let mut changed = false;
    if let Some(task) = config.spec.task(guard.jobs_stage) {
        for (job_name, handle, raw) in readings {
            changed |= stage::apply_status(task, &mut guard, &job_name, Some(&handle), raw);
        }
    }

    let before = guard.state;
    evaluate(state.executor.as_ref(), pipeline, &config.spec, &mut guard).await;

    Ok(changed || guard.state != before)
}

async fn poll_jobs(
    executor: &dyn JobExecutor,
    pipeline: &str,
    instance: &PipelineInstance,
) -> Vec<(String, JobHandle, RawJobStatus)> {
    let mut readings = Vec::new();

    for job in &instance.jobs_status {
        if job.phase.is_terminal() {
            continue;
        }
        let Some(handle) = &job.handle else {
            continue;
        };

        match executor.status(handle).await {
            Ok(raw) => readings.push((job.job_name.clone(), handle.clone(), raw)),
            Err(e) => tracing::warn!(
                "Status of job {} of {}:{} unavailable: {}",
                job.job_name,
                pipeline,
                instance.id,
                e
            ),
        }
    }

    readings
}

// =============================================================================
// Evaluation
// =============================================================================

/// Advances or finalizes an instance after its statuses changed
///
/// Loops so that stages settling immediately, such as stages whose every
/// submission failed, are handled in one pass.
pub async fn evaluate(
    executor: &dyn JobExecutor,
    pipeline: &str,
    spec: &PipelineSpec,
    instance: &mut PipelineInstance,
) {
    while instance.is_running() {
        let Some(task) = spec.task(instance.jobs_stage) else {
            let reason = format!("stage {} no longer exists", instance.jobs_stage);
            fail(instance, reason);
            return;
        };

        match stage::outcome(task, &instance.jobs_status) {
            StageOutcome::InProgress => return,

            StageOutcome::Failed { reason } => {
                tracing::warn!(
                    "Instance {}:{} failed at stage {}: {}",
                    pipeline,
                    instance.id,
                    instance.jobs_stage,
                    reason
                );
                cancel_running_jobs(executor, instance, "stage failed").await;
                fail(instance, reason);
                return;
            }

            StageOutcome::Completed { failed } if instance.jobs_stage != instance.stage => {
                // detached re-run of another stage
                let resume = instance.resume_state.take();
                if failed == 0 {
                    instance.state = resume.unwrap_or(InstanceState::Succeeded);
                    instance.message = None;
                    instance.touch();
                } else {
                    let reason = format!(
                        "{} job(s) failed re-running stage {}",
                        failed, instance.jobs_stage
                    );
                    fail(instance, reason);
                }
                return;
            }

            StageOutcome::Completed { failed } => {
                let next = instance.stage + 1;
                if next >= spec.stage_count() {
                    if failed == 0 {
                        instance.state = InstanceState::Succeeded;
                        instance.message = None;
                        instance.touch();
                        tracing::info!("Instance {}:{} succeeded", pipeline, instance.id);
                    } else {
                        let reason =
                            format!("{} job(s) failed in stage {}", failed, instance.stage);
                        fail(instance, reason);
                    }
                    return;
                }

                tracing::info!(
                    "Instance {}:{} advancing to stage {}",
                    pipeline,
                    instance.id,
                    next
                );
                instance.stage = next;
                if let Err(e) =
                    stage::advance_stage(executor, pipeline, spec, instance, next, &JobFilter::all())
                        .await
                {
                    fail(instance, e.to_string());
                    return;
                }
            }
        }
    }
}

fn fail(instance: &mut PipelineInstance, reason: String) {
    instance.state = InstanceState::Failed;
    instance.message = Some(reason);
    instance.resume_state = None;
    instance.touch();
}

/// Best-effort cancellation of the running jobs of the evaluated stage
async fn cancel_running_jobs(
    executor: &dyn JobExecutor,
    instance: &mut PipelineInstance,
    reason: &str,
) {
    for job in instance.jobs_status.iter_mut() {
        if job.phase.is_terminal() {
            continue;
        }
        if let Some(handle) = &job.handle {
            if let Err(e) = executor.cancel(handle).await {
                tracing::warn!("Failed to cancel job {}: {}", handle, e);
            }
        }
        job.phase = JobPhase::Failed {
            reason: format!("cancelled: {}", reason),
        };
    }
    instance.current = StageCounts::from_jobs(&instance.jobs_status);
}

/// Deletes every executor job the instance still tracks, finished or not
async fn release_jobs(executor: &dyn JobExecutor, instance: &PipelineInstance) {
    for handle in instance.jobs_status.iter().filter_map(|j| j.handle.as_ref()) {
        if let Err(e) = executor.cancel(handle).await {
            tracing::warn!("Failed to release job {}: {}", handle, e);
        }
    }
}

// =============================================================================
// Lookups
// =============================================================================

fn find_pipeline(state: &AppState, name: &str) -> Result<Arc<PipelineEntry>> {
    state
        .store
        .get(name)
        .ok_or_else(|| InstanceError::PipelineNotFound(name.to_string()))
}

fn find_slot(entry: &PipelineEntry, id: u64) -> Result<Arc<InstanceSlot>> {
    entry.instance(id).ok_or_else(|| InstanceError::NotFound {
        pipeline: entry.name().to_string(),
        id,
    })
}

fn conflict(id: u64, reason: SlotError) -> InstanceError {
    InstanceError::Conflict { id, reason }
}

/// Rejects a stage/filter pair before any id is allocated
fn check_selection(spec: &PipelineSpec, stage: usize, filter: &JobFilter) -> Result<()> {
    let task = spec.task(stage).ok_or(StageError::InvalidStage {
        stage,
        count: spec.stage_count(),
    })?;

    if !task.fan_out().iter().any(|slot| filter.admits(slot.name)) {
        return Err(StageError::EmptySelection { stage }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::store::Store;
    use conduit_core::domain::pipeline::{JobTemplate, Pipeline, PipelineConfig, Task};

    fn template(job: Option<&str>) -> JobTemplate {
        JobTemplate {
            job: job.map(str::to_string),
            image: "busybox".to_string(),
            ..Default::default()
        }
    }

    /// T0 with one job, T1 fanning out to `jobs`
    fn two_stage_spec(jobs: &[&str]) -> PipelineSpec {
        PipelineSpec {
            namespace: "batch".to_string(),
            tasks: vec![
                Task {
                    name: "prepare".to_string(),
                    template: Some(template(None)),
                    ..Default::default()
                },
                Task {
                    name: "shard".to_string(),
                    jobs: jobs.iter().map(|j| template(Some(j))).collect(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn setup(spec: PipelineSpec) -> (AppState, Arc<SimulatedExecutor>) {
        let executor = Arc::new(SimulatedExecutor::new());
        let state = AppState::new(Store::new(), executor.clone());
        state.store.insert(Pipeline {
            name: "etl".to_string(),
            uri: "file:///etc/conduit/etl.yaml".to_string(),
            config: PipelineConfig {
                hash: "h".to_string(),
                spec,
            },
        });
        (state, executor)
    }

    fn snapshot(state: &AppState, id: u64) -> PipelineInstance {
        state
            .store
            .get("etl")
            .unwrap()
            .instance(id)
            .unwrap()
            .snapshot()
    }

    fn handle_of(state: &AppState, id: u64, job: &str) -> JobHandle {
        snapshot(state, id)
            .job(job)
            .and_then(|j| j.handle.clone())
            .unwrap()
    }

    /// Resolves a job in the executor and lets the poller pick it up
    async fn finish(state: &AppState, executor: &SimulatedExecutor, id: u64, job: &str, ok: bool) {
        let handle = handle_of(state, id, job);
        if ok {
            executor.succeed(&handle);
        } else {
            executor.fail(&handle, "BackoffLimitExceeded");
        }
        refresh_instance(state, "etl", id).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_submits_first_stage() {
        let (state, executor) = setup(two_stage_spec(&["a", "b"]));

        let instance = start_instance(&state, "etl").await.unwrap();

        assert_eq!(instance.id, 1);
        assert_eq!(instance.stage, 0);
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.jobs_status.len(), 1);
        assert_eq!(instance.current.total(), instance.jobs_status.len());
        assert_eq!(executor.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_stages_advance_to_success() {
        let (state, executor) = setup(two_stage_spec(&["a", "b"]));
        let id = start_instance(&state, "etl").await.unwrap().id;

        finish(&state, &executor, id, "prepare", true).await;

        let instance = snapshot(&state, id);
        assert_eq!(instance.stage, 1);
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.jobs_status.len(), 2);
        assert_eq!(executor.submissions().len(), 3);

        finish(&state, &executor, id, "a", true).await;
        assert_eq!(snapshot(&state, id).state, InstanceState::Running);
        assert_eq!(snapshot(&state, id).current.success, 1);

        finish(&state, &executor, id, "b", true).await;
        let instance = snapshot(&state, id);
        assert_eq!(instance.state, InstanceState::Succeeded);
        assert_eq!(instance.current.success, 2);
    }

    #[tokio::test]
    async fn test_failed_job_fails_fast() {
        let (state, executor) = setup(two_stage_spec(&["a", "b"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        finish(&state, &executor, id, "prepare", true).await;

        let b = handle_of(&state, id, "b");
        finish(&state, &executor, id, "a", false).await;

        let instance = snapshot(&state, id);
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.stage, 1);
        assert!(instance.message.unwrap().contains("job a failed"));
        assert!(executor.is_cancelled(&b));
        assert_eq!(instance.current.running, 0);
        assert_eq!(executor.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_submission_failure_fails_instance() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        executor.reject_image("busybox");

        let instance = start_instance(&state, "etl").await.unwrap();

        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.current.failed, 1);
        assert_eq!(instance.jobs_status.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_rejects_running_and_bad_stage() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;

        let result = restart_stage(&state, "etl", id, 0).await;
        assert!(matches!(result, Err(InstanceError::Running(_))));

        finish(&state, &executor, id, "prepare", false).await;

        let result = restart_stage(&state, "etl", id, 9).await;
        assert!(matches!(
            result,
            Err(InstanceError::Stage(StageError::InvalidStage { .. }))
        ));
    }

    #[tokio::test]
    async fn test_restart_current_stage_resumes_progression() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        finish(&state, &executor, id, "prepare", false).await;
        assert_eq!(snapshot(&state, id).state, InstanceState::Failed);

        let restarted = restart_stage(&state, "etl", id, 0).await.unwrap();
        assert_eq!(restarted.id, id);
        assert_eq!(restarted.stage, 0);
        assert_eq!(restarted.state, InstanceState::Running);
        assert!(restarted.message.is_none());

        finish(&state, &executor, id, "prepare", true).await;
        assert_eq!(snapshot(&state, id).stage, 1);

        finish(&state, &executor, id, "a", true).await;
        assert_eq!(snapshot(&state, id).state, InstanceState::Succeeded);
    }

    #[tokio::test]
    async fn test_restart_releases_old_jobs_and_renames() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        let old = handle_of(&state, id, "prepare");
        finish(&state, &executor, id, "prepare", false).await;
        assert!(!executor.is_cancelled(&old));

        let restarted = restart_stage(&state, "etl", id, 0).await.unwrap();
        assert_eq!(restarted.attempt, 1);
        assert!(executor.is_cancelled(&old));

        let names: Vec<_> = executor
            .submissions()
            .into_iter()
            .map(|(_, submission)| submission.name)
            .collect();
        assert_eq!(names, vec!["etl-1-prepare", "etl-1-r1-prepare"]);
        assert_ne!(handle_of(&state, id, "prepare"), old);

        finish(&state, &executor, id, "prepare", true).await;
        let last = executor.submissions().pop().unwrap().1;
        assert_eq!(last.name, "etl-1-r1-a");
    }

    #[tokio::test]
    async fn test_restart_historical_stage_is_detached() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        finish(&state, &executor, id, "prepare", true).await;
        finish(&state, &executor, id, "a", true).await;
        let done = snapshot(&state, id);
        assert_eq!(done.state, InstanceState::Succeeded);

        let rerun = restart_stage(&state, "etl", id, 0).await.unwrap();
        assert_eq!(rerun.id, id);
        assert_eq!(rerun.stage, 1);
        assert_eq!(rerun.jobs_stage, 0);
        assert_eq!(rerun.start_stage, done.start_stage);
        assert_eq!(rerun.state, InstanceState::Running);

        let submitted = executor.submissions().len();
        finish(&state, &executor, id, "prepare", true).await;

        let instance = snapshot(&state, id);
        assert_eq!(instance.state, InstanceState::Succeeded);
        assert_eq!(instance.stage, 1);
        assert!(instance.resume_state.is_none());
        // no auto-advance into stage 1
        assert_eq!(executor.submissions().len(), submitted);
    }

    #[tokio::test]
    async fn test_restart_historical_stage_failure() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        finish(&state, &executor, id, "prepare", true).await;
        finish(&state, &executor, id, "a", true).await;

        restart_stage(&state, "etl", id, 0).await.unwrap();
        finish(&state, &executor, id, "prepare", false).await;

        let instance = snapshot(&state, id);
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.stage, 1);
    }

    #[tokio::test]
    async fn test_clone_filters_jobs() {
        let (state, executor) = setup(two_stage_spec(&["a", "b", "c"]));
        let source = start_instance(&state, "etl").await.unwrap().id;
        finish(&state, &executor, source, "prepare", true).await;

        let clone = clone_instance(
            &state,
            CloneRequest {
                pipeline: "etl".to_string(),
                instance: source,
                include: vec!["a".to_string()],
                exclude: vec![],
            },
        )
        .await
        .unwrap();

        assert_ne!(clone.id, source);
        assert_eq!(clone.stage, 1);
        assert_eq!(clone.cloned_from, Some(source));
        let names: Vec<_> = clone.jobs_status.iter().map(|j| j.job_name.as_str()).collect();
        assert_eq!(names, vec!["a"]);

        finish(&state, &executor, clone.id, "a", true).await;
        assert_eq!(snapshot(&state, clone.id).state, InstanceState::Succeeded);
        // the source is untouched
        assert_eq!(snapshot(&state, source).jobs_status.len(), 3);
    }

    #[tokio::test]
    async fn test_clone_progresses_with_full_fan_out() {
        let (state, executor) = setup(two_stage_spec(&["a", "b"]));
        let source = start_instance(&state, "etl").await.unwrap().id;

        let clone = clone_instance(
            &state,
            CloneRequest {
                pipeline: "etl".to_string(),
                instance: source,
                include: vec![],
                exclude: vec![],
            },
        )
        .await
        .unwrap();
        assert_eq!(clone.stage, 0);

        finish(&state, &executor, clone.id, "prepare", true).await;
        assert_eq!(snapshot(&state, clone.id).jobs_status.len(), 2);
    }

    #[tokio::test]
    async fn test_clone_with_empty_selection_is_rejected() {
        let (state, _executor) = setup(two_stage_spec(&["a"]));
        let source = start_instance(&state, "etl").await.unwrap().id;

        let result = clone_instance(
            &state,
            CloneRequest {
                pipeline: "etl".to_string(),
                instance: source,
                include: vec![],
                exclude: vec!["prepare".to_string()],
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(InstanceError::Stage(StageError::EmptySelection { stage: 0 }))
        ));
        assert_eq!(state.store.get("etl").unwrap().instances().len(), 1);
    }

    fn clone_all(source: u64) -> CloneRequest {
        CloneRequest {
            pipeline: "etl".to_string(),
            instance: source,
            include: vec![],
            exclude: vec![],
        }
    }

    #[tokio::test]
    async fn test_clone_copies_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = two_stage_spec(&["a"]);
        spec.storage = format!("file://{}", dir.path().display());
        let (state, _executor) = setup(spec);

        let source = start_instance(&state, "etl").await.unwrap().id;
        std::fs::create_dir_all(dir.path().join("1/out")).unwrap();
        std::fs::write(dir.path().join("1/out/part-0"), "rows").unwrap();

        let clone = clone_instance(&state, clone_all(source)).await.unwrap();

        let copied = dir.path().join(clone.id.to_string()).join("out/part-0");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "rows");
    }

    #[tokio::test]
    async fn test_clone_refuses_remote_storage() {
        let mut spec = two_stage_spec(&["a"]);
        spec.storage = "gs://bucket/etl".to_string();
        let (state, executor) = setup(spec);
        let source = start_instance(&state, "etl").await.unwrap().id;

        let result = clone_instance(&state, clone_all(source)).await;

        assert!(matches!(
            result,
            Err(InstanceError::WorkDir(WorkDirError::UnsupportedScheme(_)))
        ));
        assert_eq!(state.store.get("etl").unwrap().instances().len(), 1);
        assert_eq!(executor.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_jobs() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        let handle = handle_of(&state, id, "prepare");

        let stopped = stop_instance(&state, "etl", id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Failed);
        assert_eq!(stopped.message.as_deref(), Some(STOPPED_BY_USER));
        assert!(executor.is_cancelled(&handle));

        let result = stop_instance(&state, "etl", id).await;
        assert!(matches!(result, Err(InstanceError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_delete_and_ids_are_not_reused() {
        let (state, _executor) = setup(two_stage_spec(&["a"]));
        let first = start_instance(&state, "etl").await.unwrap().id;

        delete_instance(&state, "etl", first).await.unwrap();
        assert!(state.store.get("etl").unwrap().instances().is_empty());

        let result = delete_instance(&state, "etl", first).await;
        assert!(matches!(result, Err(InstanceError::NotFound { .. })));

        let second = start_instance(&state, "etl").await.unwrap().id;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_operator_mutation_conflicts_with_holder() {
        let (state, _executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        let slot = state.store.get("etl").unwrap().instance(id).unwrap();

        let guard = slot.lock().await.unwrap();
        let result = delete_instance(&state, "etl", id).await;
        assert!(matches!(
            result,
            Err(InstanceError::Conflict {
                reason: SlotError::Busy,
                ..
            })
        ));
        drop(guard);

        delete_instance(&state, "etl", id).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_push_on_deleted_instance_conflicts() {
        let (state, _executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;
        let slot = state.store.get("etl").unwrap().instance(id).unwrap();

        delete_instance(&state, "etl", id).await.unwrap();

        // a writer that looked the slot up before the delete
        assert_eq!(slot.lock().await.err(), Some(SlotError::Removed));

        let report = StatusReport {
            job: "prepare".to_string(),
            status: RawJobStatus::default(),
        };
        let result = report_status(&state, "etl", id, report).await;
        assert!(matches!(result, Err(InstanceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_pushed_status_advances_instance() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;

        let report = StatusReport {
            job: "prepare".to_string(),
            status: serde_json::from_str(
                r#"{"succeeded": 1, "conditions": [{"type": "Complete", "status": "True"}]}"#,
            )
            .unwrap(),
        };
        let instance = report_status(&state, "etl", id, report).await.unwrap();
        assert_eq!(instance.stage, 1);
        assert_eq!(executor.submissions().len(), 2);

        let unknown = StatusReport {
            job: "nope".to_string(),
            status: RawJobStatus::default(),
        };
        let result = report_status(&state, "etl", id, unknown).await;
        assert!(matches!(result, Err(InstanceError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn test_refresh_tolerates_unavailable_executor() {
        let (state, executor) = setup(two_stage_spec(&["a"]));
        let id = start_instance(&state, "etl").await.unwrap().id;

        executor.set_unavailable(true);
        let changed = refresh_instance(&state, "etl", id).await.unwrap();
        assert!(!changed);
        assert_eq!(snapshot(&state, id).state, InstanceState::Running);

        executor.set_unavailable(false);
        finish(&state, &executor, id, "prepare", true).await;
        assert_eq!(snapshot(&state, id).stage, 1);
    }
}
