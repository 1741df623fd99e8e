//! Job Executor Adapter
//!
//! The engine only talks to the outside world through [`JobExecutor`]: submit
//! a job, read its raw status, cancel it, expose it as a service. Everything
//! executor-specific stays behind this trait.

pub mod kubectl;
pub mod simulated;

use async_trait::async_trait;
use conduit_core::domain::job::{JobHandle, RawJobStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, ExecutorKind};

pub use kubectl::KubectlExecutor;
pub use simulated::SimulatedExecutor;

/// Label carrying the owning pipeline
pub const LABEL_PIPELINE: &str = "conduit/pipeline";
/// Label carrying the owning instance id
pub const LABEL_INSTANCE: &str = "conduit/instance";
/// Label carrying the task the job belongs to
pub const LABEL_TASK: &str = "conduit/task";
/// Label carrying the logical job name within the stage
pub const LABEL_JOB: &str = "conduit/job";

/// A fully rendered job, ready to hand to an executor
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    /// Executor-level name, unique per pipeline, instance and job
    pub name: String,
    /// Logical job name within the stage
    pub job_name: String,
    pub namespace: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub completions: u32,
    pub parallelism: u32,
    pub labels: BTreeMap<String, String>,
    /// Template fields the engine does not interpret
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A network service selecting the pods of some stage jobs
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSubmission {
    /// Executor-level name, same rules as [`JobSubmission::name`]
    pub name: String,
    pub namespace: String,
    /// `(name, port)` pairs
    pub ports: Vec<(String, u16)>,
    /// Job labels the service routes to
    pub selector: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Executor failures
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job {0} not found")]
    NotFound(JobHandle),

    #[error("executor rejected job: {0}")]
    Rejected(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("invalid executor response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Backend the stage engine submits jobs to
///
/// Statuses are read back as [`RawJobStatus`]; interpreting them is the
/// engine's business.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Submits a job and returns the handle to track it by
    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, ExecutorError>;

    /// Reads the current raw status of a submitted job
    async fn status(&self, handle: &JobHandle) -> Result<RawJobStatus, ExecutorError>;

    /// Stops a submitted job
    async fn cancel(&self, handle: &JobHandle) -> Result<(), ExecutorError>;

    /// Creates or updates a service in front of stage jobs
    async fn expose(&self, service: &ServiceSubmission) -> Result<(), ExecutorError>;
}

/// Builds the executor selected by the configuration
pub fn from_config(config: &Config) -> Arc<dyn JobExecutor> {
    match config.executor {
        ExecutorKind::Simulated => {
            tracing::info!(
                "Using simulated executor ({}s per job)",
                config.simulated_job_duration.as_secs()
            );
            Arc::new(SimulatedExecutor::with_duration(
                config.simulated_job_duration,
            ))
        }
        ExecutorKind::Kubectl => {
            tracing::info!("Using kubectl executor ({})", config.kubectl);
            Arc::new(KubectlExecutor::new(config.kubectl.clone()))
        }
    }
}
