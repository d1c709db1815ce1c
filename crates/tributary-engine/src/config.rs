//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IntegrationError, Result};

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default global cap on concurrently running syncs.
pub const DEFAULT_MAX_CONCURRENT_SYNCS: usize = 4;

/// Default scheduler tick interval in seconds.
pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 30;

/// Default retry cap when a source does not declare a retry policy.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default lead time before token expiry at which credentials are refreshed.
pub const DEFAULT_CREDENTIAL_REFRESH_SKEW_SECS: u64 = 60;

/// Default number of recent runs considered by the health monitor.
pub const DEFAULT_HEALTH_WINDOW: usize = 10;

/// Default window error rate above which a source is degraded.
pub const DEFAULT_HEALTH_ERROR_RATE: f64 = 0.5;

/// Default number of consecutive failed runs that make a source unhealthy.
pub const DEFAULT_HEALTH_CONSECUTIVE_FAILURES: u32 = 3;

/// Default latency regression factor over the window baseline.
pub const DEFAULT_HEALTH_LATENCY_FACTOR: f64 = 2.0;

/// Default webhook replay window in seconds.
pub const DEFAULT_WEBHOOK_REPLAY_WINDOW_SECS: u64 = 300;

/// Default request timeout of the shared HTTP client in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_syncs: usize,
    pub scheduler_tick_secs: u64,
    pub default_max_retries: u32,
    pub credential_refresh_skew_secs: u64,
    pub health: HealthThresholds,
    pub webhook_replay_window_secs: u64,
    pub http_timeout_secs: u64,
}

/// Health monitor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub window: usize,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub latency_factor: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window: DEFAULT_HEALTH_WINDOW,
            error_rate: DEFAULT_HEALTH_ERROR_RATE,
            consecutive_failures: DEFAULT_HEALTH_CONSECUTIVE_FAILURES,
            latency_factor: DEFAULT_HEALTH_LATENCY_FACTOR,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: DEFAULT_MAX_CONCURRENT_SYNCS,
            scheduler_tick_secs: DEFAULT_SCHEDULER_TICK_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            credential_refresh_skew_secs: DEFAULT_CREDENTIAL_REFRESH_SKEW_SECS,
            health: HealthThresholds::default(),
            webhook_replay_window_secs: DEFAULT_WEBHOOK_REPLAY_WINDOW_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from `TRIBUTARY_*` environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            max_concurrent_syncs: env_or("TRIBUTARY_MAX_CONCURRENT_SYNCS", DEFAULT_MAX_CONCURRENT_SYNCS),
            scheduler_tick_secs: env_or("TRIBUTARY_SCHEDULER_TICK_SECS", DEFAULT_SCHEDULER_TICK_SECS),
            default_max_retries: env_or("TRIBUTARY_DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            credential_refresh_skew_secs: env_or(
                "TRIBUTARY_CREDENTIAL_REFRESH_SKEW_SECS",
                DEFAULT_CREDENTIAL_REFRESH_SKEW_SECS,
            ),
            health: HealthThresholds {
                window: env_or("TRIBUTARY_HEALTH_WINDOW", DEFAULT_HEALTH_WINDOW),
                error_rate: env_or("TRIBUTARY_HEALTH_ERROR_RATE", DEFAULT_HEALTH_ERROR_RATE),
                consecutive_failures: env_or(
                    "TRIBUTARY_HEALTH_CONSECUTIVE_FAILURES",
                    DEFAULT_HEALTH_CONSECUTIVE_FAILURES,
                ),
                latency_factor: env_or("TRIBUTARY_HEALTH_LATENCY_FACTOR", DEFAULT_HEALTH_LATENCY_FACTOR),
            },
            webhook_replay_window_secs: env_or(
                "TRIBUTARY_WEBHOOK_REPLAY_WINDOW_SECS",
                DEFAULT_WEBHOOK_REPLAY_WINDOW_SECS,
            ),
            http_timeout_secs: env_or("TRIBUTARY_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_syncs == 0 {
            return Err(IntegrationError::FatalConfig(
                "max_concurrent_syncs must be at least 1".to_string(),
            ));
        }
        if self.scheduler_tick_secs == 0 {
            return Err(IntegrationError::FatalConfig(
                "scheduler_tick_secs must be greater than 0".to_string(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(IntegrationError::FatalConfig(
                "http_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.health.window == 0 {
            return Err(IntegrationError::FatalConfig(
                "health window must hold at least one run".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.error_rate) {
            return Err(IntegrationError::FatalConfig(
                "health error rate must be within [0, 1]".to_string(),
            ));
        }
        if self.health.latency_factor < 1.0 {
            return Err(IntegrationError::FatalConfig(
                "health latency factor must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.credential_refresh_skew_secs as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_syncs, 4);
        assert_eq!(config.webhook_replay_window_secs, 300);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = EngineConfig {
            max_concurrent_syncs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_http_timeout_rejected() {
        let config = EngineConfig {
            http_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("TRIBUTARY_MAX_CONCURRENT_SYNCS", "9");
        std::env::set_var("TRIBUTARY_HEALTH_WINDOW", "not-a-number");
        let config = EngineConfig::from_env().unwrap();
        std::env::remove_var("TRIBUTARY_MAX_CONCURRENT_SYNCS");
        std::env::remove_var("TRIBUTARY_HEALTH_WINDOW");

        assert_eq!(config.max_concurrent_syncs, 9);
        assert_eq!(config.health.window, DEFAULT_HEALTH_WINDOW);
    }
}
