//! Job domain types
//!
//! A job is one unit of work submitted to the executor. The executor reports a
//! raw status shaped like a Kubernetes `JobStatus`; the engine turns it into a
//! [`JobPhase`] once, when the status is ingested.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to a job returned by the executor on submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status as reported by the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawJobStatus {
    /// Pods currently running
    #[serde(default)]
    pub active: u32,
    /// Pods that completed successfully
    #[serde(default)]
    pub succeeded: u32,
    /// Pods that failed
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

/// One entry of the executor's condition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub kind: String,
    /// "True" / "False"; absent means true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "last_transition_time")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Condition type the executor uses for a successful job
pub const CONDITION_COMPLETE: &str = "Complete";
/// Condition type the executor uses for a failed job
pub const CONDITION_FAILED: &str = "Failed";
/// Synthetic condition recorded when a job could not be submitted
pub const CONDITION_SUBMIT_FAILED: &str = "SubmitFailed";

impl JobCondition {
    /// Creates a condition that holds now
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: Some("True".to_string()),
            reason: Some(reason.into()),
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Whether the condition currently holds
    pub fn holds(&self) -> bool {
        self.status
            .as_deref()
            .is_none_or(|s| s.eq_ignore_ascii_case("true"))
    }
}

/// Interpreted state of a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobPhase {
    /// Submitted and not terminal yet
    Running,
    Succeeded,
    Failed { reason: String },
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobPhase::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobPhase::Failed { .. })
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Succeeded => write!(f, "Succeeded"),
            JobPhase::Failed { reason } => write!(f, "Failed ({})", reason),
        }
    }
}

/// Tracked status of one job of a stage's fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Logical job name within the stage
    pub job_name: String,
    /// Executor handle; absent when submission failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<JobHandle>,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub conditions: Vec<JobCondition>,
    pub phase: JobPhase,
}

impl JobStatus {
    /// Entry for a job that was just handed to the executor
    pub fn submitted(job_name: impl Into<String>, handle: JobHandle) -> Self {
        Self {
            job_name: job_name.into(),
            handle: Some(handle),
            active: 0,
            succeeded: 0,
            failed: 0,
            conditions: Vec::new(),
            phase: JobPhase::Running,
        }
    }

    /// Entry for a job the executor refused
    pub fn submit_failed(job_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            job_name: job_name.into(),
            handle: None,
            active: 0,
            succeeded: 0,
            failed: 1,
            conditions: vec![JobCondition::new(CONDITION_SUBMIT_FAILED, reason.clone())],
            phase: JobPhase::Failed { reason },
        }
    }

    /// The raw executor fields of this entry
    pub fn raw(&self) -> RawJobStatus {
        RawJobStatus {
            active: self.active,
            succeeded: self.succeeded,
            failed: self.failed,
            conditions: self.conditions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_holds() {
        let mut cond = JobCondition::new(CONDITION_COMPLETE, "done");
        assert!(cond.holds());

        cond.status = Some("False".to_string());
        assert!(!cond.holds());

        cond.status = None;
        assert!(cond.holds());
    }

    #[test]
    fn test_raw_status_parses_executor_payload() {
        let json = r#"{
            "active": 0,
            "succeeded": 1,
            "conditions": [
                {"type": "Complete", "status": "True", "lastTransitionTime": "2016-08-11T15:00:00Z"}
            ]
        }"#;

        let status: RawJobStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.succeeded, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(status.conditions[0].kind, CONDITION_COMPLETE);
        assert!(status.conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn test_submit_failed_entry() {
        let entry = JobStatus::submit_failed("a", "executor unreachable");
        assert!(entry.handle.is_none());
        assert!(entry.phase.is_failed());
        assert_eq!(entry.conditions[0].kind, CONDITION_SUBMIT_FAILED);
    }
}
