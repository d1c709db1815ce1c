//! Source adapter boundary
//!
//! Vendor-specific clients live outside the engine. An adapter only has to page
//! through a provider: given the previous page token it returns the next batch of raw
//! records and the following token, or `None` when the provider is exhausted.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::models::{DataSource, RawRecord};

pub use rest::RestJsonAdapter;

/// Errors reported by adapters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("unsupported source: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Auth(_) => ErrorKind::AuthError,
            AdapterError::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            AdapterError::Transient(_) => ErrorKind::TransientNetworkError,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Malformed(_) => ErrorKind::SchemaValidationError,
            AdapterError::Unsupported(_) => ErrorKind::FatalConfigError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited { .. } | AdapterError::Transient(_) | AdapterError::Timeout(_)
        )
    }

    /// Provider supplied reset hint
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Everything an adapter needs to fetch one page
pub struct FetchRequest<'a> {
    /// Configuration snapshot of the running sync
    pub source: &'a DataSource,
    pub credential: &'a Credential,
    pub page_token: Option<&'a str>,
    /// Lower bound for incremental runs
    pub since: Option<DateTime<Utc>>,
    pub page_size: usize,
}

/// One fetched page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_page_token: Option<String>,
}

impl Page {
    pub fn last(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            next_page_token: None,
        }
    }

    pub fn with_next(records: Vec<RawRecord>, token: impl Into<String>) -> Self {
        Self {
            records,
            next_page_token: Some(token.into()),
        }
    }
}

/// Capability contract for a provider client
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Provider name this adapter serves
    fn provider(&self) -> &str;

    /// Fetch the page after `page_token`; reads must be safe to repeat
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Page, AdapterError>;

    /// Acknowledge a committed page to the provider
    ///
    /// Feeds with consumer offsets commit them here. The call is not assumed to be
    /// idempotent and is never retried automatically.
    async fn acknowledge(
        &self,
        _source: &DataSource,
        _page_token: Option<&str>,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Adapters keyed by provider name, falling back to the source family
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    by_provider: HashMap<String, Arc<dyn SourceAdapter>>,
    by_type: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the generic REST/JSON adapter serving every `rest_api` source
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register_for_type(
            crate::models::DataSourceType::RestApi,
            Arc::new(RestJsonAdapter::new(client)),
        );
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.by_provider
            .insert(adapter.provider().to_lowercase(), adapter);
    }

    pub fn register_for_type(
        &mut self,
        source_type: crate::models::DataSourceType,
        adapter: Arc<dyn SourceAdapter>,
    ) {
        self.by_type.insert(source_type.as_str(), adapter);
    }

    pub fn resolve(&self, source: &DataSource) -> Option<Arc<dyn SourceAdapter>> {
        self.by_provider
            .get(&source.provider.to_lowercase())
            .or_else(|| self.by_type.get(source.source_type.as_str()))
            .cloned()
    }
}

/// Walk a dotted path (`data.items`) into a JSON value
pub fn json_path<'v>(value: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_path() {
        let body = json!({"data": {"items": [{"id": 1}, {"id": 2}]}, "meta": {"next": "abc"}});
        assert_eq!(json_path(&body, "meta.next"), Some(&json!("abc")));
        assert_eq!(json_path(&body, "data.items.1.id"), Some(&json!(2)));
        assert_eq!(json_path(&body, "data.missing"), None);
        assert_eq!(json_path(&body, ""), Some(&body));
    }

    #[test]
    fn test_error_classification() {
        assert!(AdapterError::Transient("reset".into()).is_retryable());
        assert!(!AdapterError::Auth("expired".into()).is_retryable());
        assert_eq!(
            AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
            .retry_after(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(AdapterError::Malformed("x".into()).kind(), ErrorKind::SchemaValidationError);
    }
}
