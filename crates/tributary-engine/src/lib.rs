//! Tributary integration engine
//!
//! Registers external data sources, pulls (or receives) their records on independent
//! schedules, maps them into canonical schemas, validates and reconciles them, and
//! persists the result page by page.
//!
//! The entry point for callers is [`IntegrationService`]; everything it needs (the
//! store, adapters, credential store, registry and health monitor) is owned by the
//! service and passed explicitly, so tests build isolated instances freely.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tributary_engine::{EngineConfig, IntegrationService, MemoryStore};
//!
//! # async fn demo() -> tributary_engine::Result<()> {
//! let service = IntegrationService::builder(EngineConfig::default())
//!     .store(Arc::new(MemoryStore::new()))
//!     .build();
//! service.recover_orphaned_runs().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod adapter;
pub mod config;
pub mod conflict;
pub mod credentials;
pub mod error;
pub mod health;
pub mod mapper;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync;
pub mod validator;
pub mod webhook;

pub use config::EngineConfig;
pub use error::{ErrorKind, IntegrationError, Result, Severity, SyncError};
pub use service::{IntegrationService, IntegrationServiceBuilder, SourceHealthReport};
pub use store::{IntegrationStore, MemoryStore};

#[cfg(feature = "database")]
pub use store::postgres::PgStore;
