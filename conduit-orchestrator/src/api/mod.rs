//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod instance;
pub mod pipeline;

use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route(
            "/api/pipelines",
            get(pipeline::list_pipelines).post(pipeline::create_pipeline),
        )
        .route("/api/pipelines/count", get(pipeline::count_pipelines))
        .route(
            "/api/pipeline/{name}",
            get(pipeline::get_pipeline)
                .put(pipeline::reload_pipeline)
                .delete(pipeline::delete_pipeline),
        )
        // Instance endpoints
        .route("/api/state/{name}", put(instance::change_state))
        .route("/api/clone", put(instance::clone_instance))
        .route(
            "/api/pipeline/{name}/instances",
            delete(instance::delete_instance),
        )
        .route(
            "/api/pipeline/{name}/instance/{id}/status",
            post(instance::report_status),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
