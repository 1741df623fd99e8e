//! Pipeline-related API endpoints

use conduit_core::domain::pipeline::Pipeline;
use conduit_core::dto::pipeline::{
    CreatePipeline, ListPipelines, PipelineDetail, PipelineSummary,
};
use serde::Deserialize;

use crate::OrchestratorClient;
use crate::error::Result;

#[derive(Deserialize)]
struct Count {
    count: usize,
}

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Management
    // =============================================================================

    /// Register a pipeline whose configuration lives at `req.uri`
    ///
    /// # Example
    /// ```no_run
    /// # use conduit_client::OrchestratorClient;
    /// # use conduit_core::dto::pipeline::CreatePipeline;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let pipeline = client.create_pipeline(CreatePipeline {
    ///     name: "etl".to_string(),
    ///     uri: "https://config.example.com/etl.yaml".to_string(),
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<Pipeline> {
        let url = format!("{}/api/pipelines", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List pipelines, optionally filtered by a name regex and paginated
    pub async fn list_pipelines(&self, query: &ListPipelines) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/api/pipelines", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        self.handle_response(response).await
    }

    /// Count pipelines whose name matches the regular expression `pattern`
    pub async fn count_pipelines(&self, pattern: Option<&str>) -> Result<usize> {
        let url = format!("{}/api/pipelines/count", self.base_url);
        let query = ListPipelines {
            pattern: pattern.map(str::to_string),
            ..Default::default()
        };
        let response = self.client.get(&url).query(&query).send().await?;

        let count: Count = self.handle_response(response).await?;
        Ok(count.count)
    }

    /// Get a pipeline with its instances
    pub async fn get_pipeline(&self, name: &str) -> Result<PipelineDetail> {
        let url = format!("{}/api/pipeline/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Reload a pipeline's configuration from its URI
    pub async fn reload_pipeline(&self, name: &str) -> Result<Pipeline> {
        let url = format!("{}/api/pipeline/{}", self.base_url, name);
        let response = self.client.put(&url).send().await?;

        self.handle_response(response).await
    }

    /// Delete a pipeline and its instances
    pub async fn delete_pipeline(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/pipeline/{}", self.base_url, name);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
