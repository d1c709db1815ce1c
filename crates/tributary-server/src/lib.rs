//! Tributary Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! HTTP surface for the Tributary integration engine.
//!
//! - **API Endpoints**: source registration, manual and scheduled syncs, pipelines,
//!   conflict review and signed webhook intake under `/api/v1`
//! - **Configuration**: environment-based configuration management
//! - **Middleware**: CORS, request tracing and response compression
//!
//! Every response uses the envelope in [`api::response`]; engine errors are mapped to HTTP
//! status codes in [`error::AppError`].

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::compression::CompressionLayer;

pub use routes::AppState;

use crate::config::CorsConfig;

/// Create the application router with all routes and middleware
pub fn create_app(state: AppState, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state.clone())
        .nest("/api/v1", routes::router(state))
        // Apply layers from innermost to outermost
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}

/// Health check handler; probes the integration store
async fn health_check(State(state): State<AppState>) -> Response {
    match state.service.list_schemas().await {
        Ok(schemas) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "store": "connected",
                "schemas": schemas.len()
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Store health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "store": "unreachable"
                })),
            )
                .into_response()
        }
    }
}
