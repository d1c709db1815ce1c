//! Engine error types
//!
//! `IntegrationError` is returned by service operations. Errors recorded on a
//! [`SyncResult`](crate::models::SyncResult) are flattened into [`SyncError`] so that the
//! status and history APIs can surface them verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::adapter::AdapterError;
use crate::mapper::MappingError;
use crate::models::SourceStatus;
use crate::store::StoreError;
use crate::webhook::WebhookError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Error taxonomy shared by run-level and record-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    RateLimitExceeded,
    TransientNetworkError,
    SchemaValidationError,
    ConflictUnresolved,
    FatalConfigError,
    Cancelled,
    Timeout,
    PersistenceError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "auth_error",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::TransientNetworkError => "transient_network_error",
            ErrorKind::SchemaValidationError => "schema_validation_error",
            ErrorKind::ConflictUnresolved => "conflict_unresolved",
            ErrorKind::FatalConfigError => "fatal_config_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PersistenceError => "persistence_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a rule violation or recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

/// An error or warning attached to a SyncResult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl SyncError {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            record_id: None,
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("Data source {0} not found")]
    SourceNotFound(Uuid),

    #[error("Sync {0} not found")]
    SyncNotFound(Uuid),

    #[error("Pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("Conflict {0} not found")]
    ConflictNotFound(Uuid),

    #[error("Schema for entity '{0}' is not registered")]
    SchemaNotFound(String),

    #[error("A sync for data source {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("Data source {0} is held by an in-flight sync and cannot be modified")]
    SourceBusy(Uuid),

    #[error("Data source {id} is {status} and cannot be synchronized")]
    SourceUnavailable { id: Uuid, status: SourceStatus },

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Pipeline rejected: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline {0} is not active")]
    PipelineInactive(Uuid),

    #[error("Authentication failed for data source {source_id}: {message}")]
    Auth { source_id: Uuid, message: String },

    #[error("{kind} persisted after {attempts} attempts: {message}")]
    RetriesExhausted {
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Sync result {0} is already finalized")]
    AlreadyFinalized(Uuid),

    #[error("No adapter registered for provider '{0}'")]
    AdapterNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Webhook rejected: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl IntegrationError {
    /// Taxonomy bucket used when the error is recorded on a SyncResult
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntegrationError::FatalConfig(_)
            | IntegrationError::Mapping(_)
            | IntegrationError::SchemaNotFound(_)
            | IntegrationError::AdapterNotFound(_) => ErrorKind::FatalConfigError,
            IntegrationError::Auth { .. } => ErrorKind::AuthError,
            IntegrationError::RetriesExhausted { kind, .. } => *kind,
            IntegrationError::Adapter(e) => e.kind(),
            IntegrationError::Store(_) => ErrorKind::PersistenceError,
            _ => ErrorKind::Internal,
        }
    }

    /// Convert into a run-level error entry
    pub fn to_sync_error(&self) -> SyncError {
        SyncError::new(self.kind(), Severity::Critical, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::RateLimitExceeded).unwrap_or_default();
        assert_eq!(json, "\"rate_limit_exceeded\"");
        assert_eq!(ErrorKind::FatalConfigError.to_string(), "fatal_config_error");
    }

    #[test]
    fn test_retries_exhausted_keeps_kind() {
        let err = IntegrationError::RetriesExhausted {
            kind: ErrorKind::RateLimitExceeded,
            attempts: 4,
            message: "429".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(err.to_sync_error().severity, Severity::Critical);
    }

    #[test]
    fn test_sync_error_builders() {
        let err = SyncError::new(ErrorKind::SchemaValidationError, Severity::Error, "missing title")
            .with_field("title")
            .with_record("article:42");
        assert_eq!(err.field.as_deref(), Some("title"));
        assert_eq!(err.record_id.as_deref(), Some("article:42"));
    }
}
