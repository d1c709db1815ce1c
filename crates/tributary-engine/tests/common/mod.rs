//! Shared fixtures for engine integration tests
//!
//! [`ScriptedAdapter`] replays a queue of pages and errors instead of calling a
//! provider. Fetches can be held back behind a gate so tests can observe a run while
//! it is in flight.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tributary_engine::adapter::{AdapterError, FetchRequest, Page, SourceAdapter};
use tributary_engine::models::{CreateDataSource, RawRecord, SyncProgress, TargetSchema};
use tributary_engine::{EngineConfig, IntegrationService};
use uuid::Uuid;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tributary_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub struct ScriptedAdapter {
    provider: String,
    script: Mutex<VecDeque<Result<Page, AdapterError>>>,
    tokens: Mutex<Vec<Option<String>>>,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAdapter {
    pub fn new(provider: &str) -> Arc<Self> {
        Arc::new(Self::build(provider, None))
    }

    /// Every fetch waits for a permit released with [`ScriptedAdapter::release`]
    pub fn gated(provider: &str) -> Arc<Self> {
        Arc::new(Self::build(provider, Some(Arc::new(Semaphore::new(0)))))
    }

    fn build(provider: &str, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            provider: provider.to_string(),
            script: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            gate,
        }
    }

    pub fn push_page(&self, page: Page) {
        self.script.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_error(&self, error: AdapterError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Page tokens passed to each fetch, in call order
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Page, AdapterError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| AdapterError::Transient(e.to_string()))?
                .forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap()
            .push(request.page_token.map(str::to_string));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Page::last(Vec::new())))
    }
}

pub fn contact_schema() -> TargetSchema {
    serde_json::from_value(json!({
        "entity": "contact",
        "fields": [
            {"name": "email", "field_type": "string", "required": true},
            {"name": "name", "field_type": "string"},
            {"name": "score", "field_type": "integer"},
            {"name": "updated_at", "field_type": "timestamp"}
        ]
    }))
    .unwrap()
}

/// REST source served by `provider`, merging with last-write-wins
pub fn contact_source(name: &str, provider: &str) -> CreateDataSource {
    serde_json::from_value(json!({
        "name": name,
        "provider": provider,
        "configuration": {
            "type": "rest_api",
            "endpoint": "https://api.example.com/contacts"
        },
        "sync_settings": {
            "mode": "incremental",
            "conflict_resolution": "last_write_wins",
            "retry_policy": {
                "initial_delay_ms": 100,
                "max_delay_ms": 1000,
                "max_retries": 3,
                "jitter": false
            }
        },
        "data_mapping": {
            "target_entity": "contact",
            "key_fields": ["email"],
            "timestamp_field": "updated_at",
            "field_mappings": [
                {"source_field": "email", "target_field": "email"},
                {"source_field": "name", "target_field": "name"},
                {"source_field": "score", "target_field": "score"},
                {"source_field": "updated_at", "target_field": "updated_at"}
            ]
        }
    }))
    .unwrap()
}

pub fn contact(i: usize, name: &str, at: DateTime<Utc>) -> RawRecord {
    RawRecord::new(json!({
        "email": format!("user{i}@example.com"),
        "name": name,
        "score": i,
        "updated_at": at.to_rfc3339()
    }))
}

pub fn contacts(range: std::ops::Range<usize>, name: &str, at: DateTime<Utc>) -> Vec<RawRecord> {
    range.map(|i| contact(i, name, at)).collect()
}

pub fn contact_key(i: usize) -> String {
    format!("contact:user{i}@example.com")
}

pub fn service_with(config: EngineConfig, adapters: &[Arc<ScriptedAdapter>]) -> IntegrationService {
    let mut builder = IntegrationService::builder(config);
    for adapter in adapters {
        builder = builder.adapter(adapter.clone());
    }
    builder.build()
}

/// Service with the contact schema and one source served by `adapter`
pub async fn setup(adapter: &Arc<ScriptedAdapter>) -> (IntegrationService, Uuid) {
    init_tracing();
    let service = service_with(EngineConfig::default(), std::slice::from_ref(adapter));
    service.register_schema(contact_schema()).await.unwrap();
    let source = service
        .create_data_source(contact_source("contacts", adapter.provider()))
        .await
        .unwrap();
    (service, source.id)
}

/// Poll the run until `done` holds or five seconds pass
pub async fn wait_until(
    service: &IntegrationService,
    sync_id: Uuid,
    done: impl Fn(&SyncProgress) -> bool,
) -> SyncProgress {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let progress = service.get_sync_status(sync_id).await.unwrap();
        if done(&progress) || tokio::time::Instant::now() >= deadline {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
