//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of failed pods a job may accumulate before it is considered
/// terminally failed, when the template asks for fewer completions.
pub const MIN_FAILURE_THRESHOLD: u32 = 4;

/// Pipeline definition
///
/// A named spec loaded from `uri`. The spec is replaced wholesale on reload;
/// a given `config.hash` always identifies the same spec revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub uri: String,
    pub config: PipelineConfig,
}

/// Parsed pipeline configuration together with the hash of its source bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub hash: String,
    pub spec: PipelineSpec,
}

/// Aggregate execution state of a pipeline across its instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// No instance is running
    Stopped,
    /// At least one instance is running
    Running,
}

/// Specification of a pipeline: an ordered list of stages plus targeting info
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Deployment namespace handed to the executor
    #[serde(default)]
    pub namespace: String,

    /// Storage root; each instance works under `storage/<id>`
    #[serde(default)]
    pub storage: String,

    /// Optional crontab-style schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    /// Ordered stages; the index is the stage identifier
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl PipelineSpec {
    /// Number of stages in the pipeline
    pub fn stage_count(&self) -> usize {
        self.tasks.len()
    }

    /// Returns the task for a stage index, if it exists
    pub fn task(&self, stage: usize) -> Option<&Task> {
        self.tasks.get(stage)
    }

    /// Work directory of an instance, empty when the spec has no storage
    pub fn work_dir(&self, instance_id: u64) -> String {
        if self.storage.is_empty() {
            return String::new();
        }
        if self.storage.ends_with('/') {
            format!("{}{}", self.storage, instance_id)
        } else {
            format!("{}/{}", self.storage, instance_id)
        }
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,

    /// Single-job form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<JobTemplate>,

    /// Fan-out form: one job per template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobTemplate>,

    /// Keep going when some jobs of this stage fail
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Network services exposing the stage's jobs, created before they start
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
}

/// Network service in front of the jobs of a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Job whose pods back the service; every job of the stage when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// Named service port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub name: String,
    pub port: u16,
}

/// A job of a stage's fan-out with its resolved name
#[derive(Debug, Clone, Copy)]
pub struct JobSlot<'a> {
    pub name: &'a str,
    pub template: &'a JobTemplate,
}

impl Task {
    /// Expands the task into its fan-out, in declaration order
    ///
    /// A non-empty `jobs` list wins; otherwise the single `template` yields
    /// exactly one job named after the task.
    pub fn fan_out(&self) -> Vec<JobSlot<'_>> {
        if !self.jobs.is_empty() {
            return self
                .jobs
                .iter()
                .map(|template| JobSlot {
                    name: template.job.as_deref().unwrap_or_default(),
                    template,
                })
                .collect();
        }

        self.template
            .iter()
            .map(|template| JobSlot {
                name: &self.name,
                template,
            })
            .collect()
    }

    /// Number of jobs the task fans out to
    pub fn fan_out_count(&self) -> usize {
        if self.jobs.is_empty() {
            usize::from(self.template.is_some())
        } else {
            self.jobs.len()
        }
    }

    /// Looks up a job template by job name
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.fan_out()
            .into_iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.template)
    }
}

/// Parameters of a single job submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Job name; required inside a fan-out list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    /// Container image to execute
    #[serde(default)]
    pub image: String,

    /// Container arguments; placeholders are expanded at submission
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Number of successful completions required (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,

    /// Pods allowed to run at once (defaults to `instances`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,

    /// Executor-specific fields, forwarded untouched
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobTemplate {
    pub fn instances(&self) -> u32 {
        self.instances.filter(|n| *n > 0).unwrap_or(1)
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.instances())
    }

    /// Failed pod count past which the job is terminally failed
    pub fn failure_threshold(&self) -> u32 {
        self.instances().max(MIN_FAILURE_THRESHOLD)
    }
}

/// Crontab(5)-style schedule
///
/// Every field accepts `*`, numbers, comma lists and `a-b` ranges; `weekday`
/// and `month` also accept three-letter names. Missing fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
}

impl Schedule {
    /// True when no field constrains anything
    pub fn is_empty(&self) -> bool {
        [
            &self.min,
            &self.hour,
            &self.day,
            &self.weekday,
            &self.month,
        ]
        .iter()
        .all(|field| field.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}
