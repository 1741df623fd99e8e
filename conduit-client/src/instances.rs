//! Instance-related API endpoints

use conduit_core::domain::instance::PipelineInstance;
use conduit_core::domain::job::RawJobStatus;
use conduit_core::dto::instance::{
    CloneRequest, DeleteInstance, StateAction, StateRequest, StatusReport,
};

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    // =============================================================================
    // Instance Control
    // =============================================================================

    /// Start a new instance of a pipeline at its first stage
    pub async fn start_instance(&self, pipeline: &str) -> Result<PipelineInstance> {
        self.change_state(
            pipeline,
            StateRequest {
                action: StateAction::Start,
                id: 0,
                stage: 0,
            },
        )
        .await
    }

    /// Restart an existing instance at `stage`
    pub async fn restart_stage(
        &self,
        pipeline: &str,
        id: u64,
        stage: usize,
    ) -> Result<PipelineInstance> {
        self.change_state(
            pipeline,
            StateRequest {
                action: StateAction::Start,
                id,
                stage,
            },
        )
        .await
    }

    /// Abort a running instance
    pub async fn stop_instance(&self, pipeline: &str, id: u64) -> Result<PipelineInstance> {
        self.change_state(
            pipeline,
            StateRequest {
                action: StateAction::Stop,
                id,
                stage: 0,
            },
        )
        .await
    }

    async fn change_state(&self, pipeline: &str, req: StateRequest) -> Result<PipelineInstance> {
        let url = format!("{}/api/state/{}", self.base_url, pipeline);
        let response = self.client.put(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Clone an instance, re-running its current stage with a job filter
    pub async fn clone_instance(&self, req: CloneRequest) -> Result<PipelineInstance> {
        let url = format!("{}/api/clone", self.base_url);
        let response = self.client.put(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Delete an instance
    pub async fn delete_instance(&self, pipeline: &str, id: u64) -> Result<()> {
        let url = format!("{}/api/pipeline/{}/instances", self.base_url, pipeline);
        let response = self
            .client
            .delete(&url)
            .json(&DeleteInstance { instance: id })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Push the raw status of one job of an instance
    pub async fn report_status(
        &self,
        pipeline: &str,
        id: u64,
        job: &str,
        status: RawJobStatus,
    ) -> Result<PipelineInstance> {
        let url = format!(
            "{}/api/pipeline/{}/instance/{}/status",
            self.base_url, pipeline, id
        );
        let report = StatusReport {
            job: job.to_string(),
            status,
        };
        let response = self.client.post(&url).json(&report).send().await?;

        self.handle_response(response).await
    }
}
