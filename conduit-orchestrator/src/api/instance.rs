//! Instance API Handlers
//!
//! HTTP endpoints that start, restart, stop, clone and delete pipeline
//! instances, and accept pushed job statuses.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conduit_core::domain::instance::PipelineInstance;
use conduit_core::dto::instance::{
    CloneRequest, DeleteInstance, StateAction, StateRequest, StatusReport,
};

use crate::api::error::{ApiError, ApiResult};
use crate::service::instance_service;
use crate::state::AppState;

/// PUT /api/state/{name}
/// Start a new instance (`id` 0), restart a stage, or stop an instance
pub async fn change_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<StateRequest>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::info!(
        "State change on {}: {:?} id={} stage={}",
        name,
        req.action,
        req.id,
        req.stage
    );

    let instance = match (req.action, req.id) {
        (StateAction::Start, 0) => instance_service::start_instance(&state, &name).await?,
        (StateAction::Start, id) => {
            instance_service::restart_stage(&state, &name, id, req.stage).await?
        }
        (StateAction::Stop, 0) => {
            return Err(ApiError::BadRequest(
                "stop requires an instance id".to_string(),
            ));
        }
        (StateAction::Stop, id) => instance_service::stop_instance(&state, &name, id).await?,
    };

    Ok(Json(instance))
}

/// PUT /api/clone
/// Clone an instance, re-running its stage with a job filter
pub async fn clone_instance(
    State(state): State<AppState>,
    Json(req): Json<CloneRequest>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::info!(
        "Cloning {}:{} (include {:?}, exclude {:?})",
        req.pipeline,
        req.instance,
        req.include,
        req.exclude
    );

    let instance = instance_service::clone_instance(&state, req).await?;

    Ok(Json(instance))
}

/// DELETE /api/pipeline/{name}/instances
/// Delete an instance
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<DeleteInstance>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting instance {}:{}", name, req.instance);

    instance_service::delete_instance(&state, &name, req.instance).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/pipeline/{name}/instance/{id}/status
/// Push the raw status of one job
pub async fn report_status(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, u64)>,
    Json(report): Json<StatusReport>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::debug!("Status pushed for {}:{} job {}", name, id, report.job);

    let instance = instance_service::report_status(&state, &name, id, report).await?;

    Ok(Json(instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::store::Store;
    use conduit_core::domain::instance::InstanceState;
    use conduit_core::domain::pipeline::{
        JobTemplate, Pipeline, PipelineConfig, PipelineSpec, Task,
    };
    use std::sync::Arc;

    fn state() -> AppState {
        let state = AppState::new(Store::new(), Arc::new(SimulatedExecutor::new()));
        let spec = PipelineSpec {
            tasks: vec![Task {
                name: "shard".to_string(),
                jobs: ["a", "b", "c"]
                    .iter()
                    .map(|job| JobTemplate {
                        job: Some(job.to_string()),
                        image: "busybox".to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        state.store.insert(Pipeline {
            name: "etl".to_string(),
            uri: "file:///etl.yaml".to_string(),
            config: PipelineConfig {
                hash: "h".to_string(),
                spec,
            },
        });
        state
    }

    fn request(action: StateAction, id: u64, stage: usize) -> Json<StateRequest> {
        Json(StateRequest { action, id, stage })
    }

    #[tokio::test]
    async fn test_start_restart_and_stop() {
        let state = state();
        let name = || Path("etl".to_string());

        let Json(started) = change_state(State(state.clone()), name(), request(StateAction::Start, 0, 0))
            .await
            .unwrap();
        assert_eq!(started.jobs_status.len(), 3);

        let restart =
            change_state(State(state.clone()), name(), request(StateAction::Start, started.id, 0))
                .await;
        assert!(matches!(restart, Err(ApiError::Conflict(_))));

        let stop_without_id =
            change_state(State(state.clone()), name(), request(StateAction::Stop, 0, 0)).await;
        assert!(matches!(stop_without_id, Err(ApiError::BadRequest(_))));

        let Json(stopped) =
            change_state(State(state.clone()), name(), request(StateAction::Stop, started.id, 0))
                .await
                .unwrap();
        assert_eq!(stopped.state, InstanceState::Failed);

        let Json(restarted) =
            change_state(State(state.clone()), name(), request(StateAction::Start, started.id, 0))
                .await
                .unwrap();
        assert_eq!(restarted.id, started.id);
        assert_eq!(restarted.state, InstanceState::Running);

        let unknown = change_state(
            State(state),
            Path("nope".to_string()),
            request(StateAction::Start, 0, 0),
        )
        .await;
        assert!(matches!(unknown, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clone_and_delete() {
        let state = state();
        let Json(source) = change_state(
            State(state.clone()),
            Path("etl".to_string()),
            request(StateAction::Start, 0, 0),
        )
        .await
        .unwrap();

        let req = CloneRequest {
            pipeline: "etl".to_string(),
            instance: source.id,
            include: vec!["a".to_string(), "b".to_string()],
            exclude: vec!["b".to_string()],
        };
        let Json(clone) = clone_instance(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(clone.jobs_status.len(), 1);
        assert_eq!(clone.cloned_from, Some(source.id));

        let empty = CloneRequest {
            pipeline: "etl".to_string(),
            instance: source.id,
            include: vec!["zzz".to_string()],
            exclude: vec![],
        };
        let result = clone_instance(State(state.clone()), Json(empty)).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let status = delete_instance(
            State(state.clone()),
            Path("etl".to_string()),
            Json(DeleteInstance {
                instance: clone.id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let pushed = report_status(
            State(state),
            Path(("etl".to_string(), clone.id)),
            Json(StatusReport {
                job: "a".to_string(),
                status: Default::default(),
            }),
        )
        .await;
        assert!(matches!(pushed, Err(ApiError::NotFound(_))));
    }
}
