//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline management.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::dto::pipeline::{
    CreatePipeline, ListPipelines, PipelineDetail, PipelineSummary,
};
use serde_json::{Value, json};

use crate::api::error::ApiResult;
use crate::service::pipeline_service;
use crate::state::AppState;

/// POST /api/pipelines
/// Register a pipeline from its configuration URI
pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    tracing::info!("Creating pipeline: {} from {}", req.name, req.uri);

    let pipeline = pipeline_service::create_pipeline(&state, req).await?;

    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /api/pipelines?pattern=&start=&limit=
/// List pipelines; `pattern` is a regular expression over the name
pub async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelines>,
) -> ApiResult<Json<Vec<PipelineSummary>>> {
    tracing::debug!("Listing pipelines: {:?}", query);

    let pipelines = pipeline_service::list_pipelines(&state, &query)?;

    Ok(Json(pipelines))
}

/// GET /api/pipelines/count?pattern=
pub async fn count_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelines>,
) -> ApiResult<Json<Value>> {
    let count = pipeline_service::count_pipelines(&state, query.pattern.as_deref())?;
    Ok(Json(json!({ "count": count })))
}

/// GET /api/pipeline/{name}
/// Get a pipeline with its instances
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineDetail>> {
    tracing::debug!("Getting pipeline: {}", name);

    let detail = pipeline_service::get_pipeline(&state, &name)?;

    Ok(Json(detail))
}

/// PUT /api/pipeline/{name}
/// Reload a pipeline's configuration from its URI
pub async fn reload_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Pipeline>> {
    tracing::info!("Reloading pipeline: {}", name);

    let pipeline = pipeline_service::reload_pipeline(&state, &name).await?;

    Ok(Json(pipeline))
}

/// DELETE /api/pipeline/{name}
/// Delete a pipeline and its instances
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", name);

    pipeline_service::delete_pipeline(&state, &name)?;

    Ok(StatusCode::NO_CONTENT)
}
