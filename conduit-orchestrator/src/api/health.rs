//! Health Check API Handler

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /health
/// Liveness check, with the number of registered pipelines
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pipelines": state.store.entries().len(),
    }))
}
