use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_sync_status))
        .route("/:id/result", get(get_sync_result))
        .route("/:id/cancel", post(cancel_sync))
}

#[tracing::instrument(skip(state), fields(sync_id = %id))]
async fn get_sync_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let progress = state.service.get_sync_status(id).await?;
    Ok(ApiResponse::success(progress).into_response())
}

#[tracing::instrument(skip(state), fields(sync_id = %id))]
async fn get_sync_result(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let result = state.service.get_sync_result(id).await?;
    Ok(ApiResponse::success(result).into_response())
}

#[tracing::instrument(skip(state), fields(sync_id = %id))]
async fn cancel_sync(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let progress = state.service.cancel_sync(id).await?;

    tracing::info!(sync_id = %id, "Sync cancellation requested via API");

    Ok(ApiResponse::success(progress).into_response())
}
