//! Error types shared across Tributary crates

use thiserror::Error;

/// Main error type for shared utilities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TributaryError {
    #[error("Invalid {kind}: '{value}'")]
    Parse { kind: &'static str, value: String },
}

impl TributaryError {
    pub fn parse(kind: &'static str, value: impl Into<String>) -> Self {
        TributaryError::Parse {
            kind,
            value: value.into(),
        }
    }
}
