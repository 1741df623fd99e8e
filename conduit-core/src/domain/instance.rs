//! Pipeline instance domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{JobPhase, JobStatus};

/// One execution attempt of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInstance {
    /// Unique, monotonically increasing within a pipeline
    pub id: u64,

    /// Stage currently executing, or last executed
    pub stage: usize,

    /// Stage the `jobs_status` entries belong to
    pub jobs_stage: usize,

    /// Stage the instance was last (re)started at
    pub start_stage: usize,

    /// Number of stage restarts; keeps executor job names of re-runs distinct
    #[serde(default)]
    pub attempt: u32,

    pub state: InstanceState,

    /// Job counts over `jobs_status`
    pub current: StageCounts,

    pub jobs_status: Vec<JobStatus>,

    /// Source instance when this instance is a clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_from: Option<u64>,

    /// Reason of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// State to return to once a re-run of a historical stage succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<InstanceState>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineInstance {
    /// Creates a pending instance positioned at `stage`
    pub fn new(id: u64, stage: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            stage,
            jobs_stage: stage,
            start_stage: stage,
            attempt: 0,
            state: InstanceState::Pending,
            current: StageCounts::default(),
            jobs_status: Vec::new(),
            cloned_from: None,
            message: None,
            resume_state: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, InstanceState::Running | InstanceState::Pending)
    }

    /// Looks up the tracked status of a job of the evaluated stage
    pub fn job(&self, name: &str) -> Option<&JobStatus> {
        self.jobs_status.iter().find(|j| j.job_name == name)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Instance-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Succeeded | InstanceState::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "Pending"),
            InstanceState::Running => write!(f, "Running"),
            InstanceState::Succeeded => write!(f, "Succeeded"),
            InstanceState::Failed => write!(f, "Failed"),
        }
    }
}

/// Live job counts of the evaluated stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

impl StageCounts {
    /// Counts each job once, by phase
    pub fn from_jobs(jobs: &[JobStatus]) -> Self {
        jobs.iter()
            .fold(StageCounts::default(), |mut counts, job| {
                match job.phase {
                    JobPhase::Running => counts.running += 1,
                    JobPhase::Succeeded => counts.success += 1,
                    JobPhase::Failed { .. } => counts.failed += 1,
                }
                counts
            })
    }

    pub fn total(&self) -> usize {
        self.running + self.success + self.failed
    }
}
