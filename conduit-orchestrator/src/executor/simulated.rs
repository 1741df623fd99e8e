//! In-process executor
//!
//! Keeps submitted jobs in memory. Jobs complete on their own after a fixed
//! duration, or are driven explicitly with [`SimulatedExecutor::set_status`].

use async_trait::async_trait;
use conduit_core::domain::job::{
    CONDITION_COMPLETE, CONDITION_FAILED, JobCondition, JobHandle, RawJobStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{ExecutorError, JobExecutor, JobSubmission, ServiceSubmission};

struct SimulatedJob {
    seq: u64,
    submission: JobSubmission,
    submitted_at: Instant,
    /// Status forced by `set_status`; wins over the clock
    forced: Option<RawJobStatus>,
    cancelled: bool,
}

/// Executor that runs nothing and reports scripted statuses
pub struct SimulatedExecutor {
    /// Run time of a job; `None` keeps jobs active until told otherwise
    duration: Option<Duration>,
    jobs: Mutex<HashMap<JobHandle, SimulatedJob>>,
    /// Images whose submission is refused
    rejected_images: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
    services: Mutex<Vec<ServiceSubmission>>,
    sequence: AtomicU64,
}

impl SimulatedExecutor {
    /// Jobs stay active until [`set_status`](Self::set_status) resolves them
    pub fn new() -> Self {
        Self {
            duration: None,
            jobs: Mutex::new(HashMap::new()),
            rejected_images: Mutex::new(HashSet::new()),
            unavailable: Mutex::new(false),
            services: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Jobs succeed once `duration` has elapsed since submission
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Self::new()
        }
    }

    /// Overrides the status reported for a job
    pub fn set_status(&self, handle: &JobHandle, status: RawJobStatus) -> bool {
        match lock(&self.jobs).get_mut(handle) {
            Some(job) => {
                job.forced = Some(status);
                true
            }
            None => false,
        }
    }

    /// Marks a job as completed successfully
    pub fn succeed(&self, handle: &JobHandle) -> bool {
        let completions = lock(&self.jobs)
            .get(handle)
            .map(|job| job.submission.completions)
            .unwrap_or(1);
        self.set_status(handle, completed(completions))
    }

    /// Marks a job as failed with the given reason
    pub fn fail(&self, handle: &JobHandle, reason: &str) -> bool {
        self.set_status(handle, failed(1, reason))
    }

    /// Refuses every later submission of this image
    pub fn reject_image(&self, image: &str) {
        lock(&self.rejected_images).insert(image.to_string());
    }

    /// Makes every later call fail as if the backend were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    /// Submissions received so far, oldest first
    pub fn submissions(&self) -> Vec<(JobHandle, JobSubmission)> {
        let jobs = lock(&self.jobs);
        let mut submitted: Vec<_> = jobs
            .iter()
            .map(|(handle, job)| (job.seq, handle.clone(), job.submission.clone()))
            .collect();
        submitted.sort_by_key(|(seq, _, _)| *seq);
        submitted
            .into_iter()
            .map(|(_, handle, submission)| (handle, submission))
            .collect()
    }

    /// Services exposed so far, latest version of each
    pub fn services(&self) -> Vec<ServiceSubmission> {
        lock(&self.services).clone()
    }

    /// Whether a job was cancelled
    pub fn is_cancelled(&self, handle: &JobHandle) -> bool {
        lock(&self.jobs).get(handle).is_some_and(|job| job.cancelled)
    }

    fn check_available(&self) -> Result<(), ExecutorError> {
        if *lock(&self.unavailable) {
            return Err(ExecutorError::Unavailable(
                "simulated executor is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, ExecutorError> {
        self.check_available()?;

        if lock(&self.rejected_images).contains(&job.image) {
            return Err(ExecutorError::Rejected(format!(
                "image {} is not allowed",
                job.image
            )));
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = JobHandle(format!("{}/{}.{}", job.namespace, job.name, seq));

        tracing::debug!("Simulated job {} submitted", handle);

        lock(&self.jobs).insert(
            handle.clone(),
            SimulatedJob {
                seq,
                submission: job.clone(),
                submitted_at: Instant::now(),
                forced: None,
                cancelled: false,
            },
        );

        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> Result<RawJobStatus, ExecutorError> {
        self.check_available()?;

        let jobs = lock(&self.jobs);
        let job = jobs
            .get(handle)
            .ok_or_else(|| ExecutorError::NotFound(handle.clone()))?;

        if job.cancelled {
            return Ok(failed(0, "Cancelled"));
        }
        if let Some(status) = &job.forced {
            return Ok(status.clone());
        }

        let done = self
            .duration
            .is_some_and(|d| job.submitted_at.elapsed() >= d);
        if done {
            return Ok(completed(job.submission.completions));
        }

        Ok(RawJobStatus {
            active: job.submission.parallelism.max(1),
            ..Default::default()
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), ExecutorError> {
        self.check_available()?;

        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(handle)
            .ok_or_else(|| ExecutorError::NotFound(handle.clone()))?;
        job.cancelled = true;

        tracing::debug!("Simulated job {} cancelled", handle);
        Ok(())
    }

    async fn expose(&self, service: &ServiceSubmission) -> Result<(), ExecutorError> {
        self.check_available()?;

        let mut services = lock(&self.services);
        match services
            .iter_mut()
            .find(|s| s.namespace == service.namespace && s.name == service.name)
        {
            Some(existing) => *existing = service.clone(),
            None => services.push(service.clone()),
        }
        Ok(())
    }
}

fn completed(completions: u32) -> RawJobStatus {
    RawJobStatus {
        active: 0,
        succeeded: completions.max(1),
        failed: 0,
        conditions: vec![JobCondition::new(CONDITION_COMPLETE, "Completed")],
    }
}

fn failed(failures: u32, reason: &str) -> RawJobStatus {
    RawJobStatus {
        active: 0,
        succeeded: 0,
        failed: failures,
        conditions: vec![JobCondition::new(CONDITION_FAILED, reason)],
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
