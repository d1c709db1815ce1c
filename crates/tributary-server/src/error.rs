//! Server-specific error types

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tributary_engine::store::StoreError;
use tributary_engine::webhook::WebhookError;
use tributary_engine::IntegrationError;

use crate::api::ErrorResponse;

/// Result type alias for route handlers
pub type ApiResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

fn classify(err: &IntegrationError) -> (StatusCode, &'static str) {
    use IntegrationError as E;
    match err {
        E::SourceNotFound(_) | E::SyncNotFound(_) | E::PipelineNotFound(_) | E::ConflictNotFound(_) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        }
        E::AlreadyRunning(_) | E::SourceBusy(_) | E::AlreadyFinalized(_) => {
            (StatusCode::CONFLICT, "CONFLICT")
        }
        E::SourceUnavailable { .. } | E::PipelineInactive(_) => {
            (StatusCode::CONFLICT, "UNAVAILABLE")
        }
        E::SchemaNotFound(_)
        | E::FatalConfig(_)
        | E::Mapping(_)
        | E::InvalidPipeline(_)
        | E::AdapterNotFound(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
        E::InvalidInput(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        E::Webhook(WebhookError::NotWebhookSource(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        E::Webhook(WebhookError::MalformedPayload(_)) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        E::Webhook(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        E::Auth { .. } | E::RetriesExhausted { .. } | E::Adapter(_) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        }
        E::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        E::Store(StoreError::Duplicate { .. }) | E::Store(StoreError::StaleWrite(_)) => {
            (StatusCode::CONFLICT, "CONFLICT")
        }
        E::Store(StoreError::Finalized(_)) => (StatusCode::CONFLICT, "CONFLICT"),
        E::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("BAD_REQUEST", message),
            ),
            AppError::NotFound(message) => {
                (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", message))
            }
            AppError::Integration(err) => {
                let (status, code) = classify(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                    (
                        status,
                        ErrorResponse::new(code, "An internal error occurred"),
                    )
                } else if status == StatusCode::BAD_GATEWAY {
                    tracing::warn!(error = %err, "provider call failed");
                    (
                        status,
                        ErrorResponse::with_details(code, err.to_string(), json!({ "kind": err.kind() })),
                    )
                } else {
                    (status, ErrorResponse::new(code, err.to_string()))
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
