//! Pipeline DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::PipelineInstance;
use crate::domain::pipeline::{PipelineConfig, PipelineSpec, PipelineState};

/// Request to register a new pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub name: String,
    /// Where the configuration lives (`file://`, path, or `http(s)://`)
    pub uri: String,
}

/// Entry of the pipeline listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub name: String,
    pub spec: PipelineSpec,
    pub state: PipelineState,
}

/// Full view of a pipeline and its instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDetail {
    pub name: String,
    pub uri: String,
    pub config: PipelineConfig,
    pub state: PipelineState,
    /// Next scheduled start, for scheduled pipelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub instances: Vec<PipelineInstance>,
}

/// Query parameters of the pipeline listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPipelines {
    /// Regular expression the pipeline name must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Index of the first entry, in name order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    /// Maximum number of entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}
