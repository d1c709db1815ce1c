use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tributary_engine::models::{CreatePipeline, PipelineState};
use tributary_engine::IntegrationError;
use uuid::Uuid;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_pipeline).get(list_pipelines))
        .route("/:id", get(monitor_pipeline))
        .route("/:id/activate", post(activate_pipeline))
        .route("/:id/deactivate", post(deactivate_pipeline))
        .route("/:id/run", post(run_pipeline))
}

#[tracing::instrument(skip(state, payload))]
async fn create_pipeline(
    State(state): State<AppState>,
    payload: Result<Json<CreatePipeline>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let pipeline = state.service.create_pipeline(request).await?;

    tracing::info!(pipeline_id = %pipeline.id, stages = pipeline.stages.len(), "Pipeline created via API");

    Ok(ApiResponse::success(pipeline).with_status(StatusCode::CREATED))
}

#[tracing::instrument(skip(state))]
async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Response> {
    let pipelines = state.service.list_pipelines().await?;
    Ok(ApiResponse::success(pipelines).into_response())
}

/// Definition state plus the live or most recent run
#[tracing::instrument(skip(state), fields(pipeline_id = %id))]
async fn monitor_pipeline(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let report = state.service.monitor_pipeline(id).await?;
    Ok(ApiResponse::success(report).into_response())
}

#[tracing::instrument(skip(state), fields(pipeline_id = %id))]
async fn activate_pipeline(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let pipeline = state.service.activate_pipeline(id).await?;
    Ok(ApiResponse::success(pipeline).into_response())
}

#[tracing::instrument(skip(state), fields(pipeline_id = %id))]
async fn deactivate_pipeline(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let pipeline = state.service.deactivate_pipeline(id).await?;
    Ok(ApiResponse::success(pipeline).into_response())
}

/// Starts a run in the background; progress is read from `GET /pipelines/:id`
#[tracing::instrument(skip(state), fields(pipeline_id = %id))]
async fn run_pipeline(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let pipeline = state.service.get_pipeline(id).await?;
    if pipeline.state != PipelineState::Active {
        return Err(IntegrationError::PipelineInactive(id).into());
    }

    let service = state.service.clone();
    tokio::spawn(async move {
        match service.run_pipeline(id).await {
            Ok(result) => {
                tracing::info!(pipeline_id = %id, status = ?result.status, "Pipeline run finished")
            }
            Err(e) => tracing::error!(pipeline_id = %id, error = %e, "Pipeline run failed to start"),
        }
    });

    Ok(ApiResponse::success(json!({ "pipeline_id": id, "state": "running" }))
        .with_status(StatusCode::ACCEPTED))
}
