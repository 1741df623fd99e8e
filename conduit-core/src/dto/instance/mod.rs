//! Instance DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::RawJobStatus;

/// Action of a state-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    /// Start a new instance (`id == 0`) or restart a stage of an existing one
    Start,
    /// Abort a running instance
    Stop,
}

/// Request to change the execution state of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub action: StateAction,
    /// Instance id; 0 targets a new instance
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub stage: usize,
}

/// Request to clone an instance with a filtered job set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRequest {
    pub pipeline: String,
    pub instance: u64,
    /// Job names to re-run; empty means every job of the stage
    #[serde(default)]
    pub include: Vec<String>,
    /// Job names to leave out
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Request to delete an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInstance {
    pub instance: u64,
}

/// Job status pushed by an executor instead of being polled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub job: String,
    pub status: RawJobStatus,
}
