//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::instance_service::InstanceError;
use crate::service::pipeline_service::PipelineError;
use crate::service::stage::StageError;
use crate::service::workdir::WorkDirError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => {
                tracing::debug!("Conflict: {}", msg);
                (StatusCode::CONFLICT, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let msg = err.to_string();
        match err {
            PipelineError::NotFound(_) => ApiError::NotFound(msg),
            PipelineError::AlreadyExists(_) | PipelineError::Running(_) => ApiError::Conflict(msg),
            PipelineError::ValidationError(_) => ApiError::BadRequest(msg),
            PipelineError::LoadError { .. } => ApiError::BadRequest(msg),
        }
    }
}

impl From<InstanceError> for ApiError {
    fn from(err: InstanceError) -> Self {
        let msg = err.to_string();
        match err {
            InstanceError::PipelineNotFound(_) | InstanceError::NotFound { .. } => {
                ApiError::NotFound(msg)
            }
            InstanceError::Running(_)
            | InstanceError::NotRunning(_)
            | InstanceError::Conflict { .. } => ApiError::Conflict(msg),
            InstanceError::UnknownJob { .. } => ApiError::BadRequest(msg),
            InstanceError::Stage(StageError::InvalidStage { .. })
            | InstanceError::Stage(StageError::EmptySelection { .. }) => ApiError::BadRequest(msg),
            InstanceError::WorkDir(WorkDirError::UnsupportedScheme(_)) => {
                ApiError::BadRequest(msg)
            }
            InstanceError::WorkDir(WorkDirError::Io { .. }) => ApiError::InternalError(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
