//! Tributary Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging bootstrap and content fingerprints used by every
//! Tributary workspace member.
//!
//! # Example
//!
//! ```no_run
//! use tributary_common::fingerprint::fingerprint_json;
//! use tributary_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let hash = fingerprint_json(&serde_json::json!({ "title": "Hello" }));
//!     tracing::info!(%hash, "fingerprint computed");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

// Re-export commonly used types
pub use error::TributaryError;
