//! Configuration management

use serde::{Deserialize, Serialize};
use tributary_engine::EngineConfig;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Absent when the engine should keep its state in memory
    pub database: Option<DatabaseConfig>,
    pub cors: CorsConfig,
    pub engine: EngineConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            });

        let config = Config {
            server: ServerConfig {
                host: std::env::var("TRIBUTARY_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: std::env::var("TRIBUTARY_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: std::env::var("TRIBUTARY_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            database,
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: std::env::var("CORS_ALLOW_CREDENTIALS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(false),
            },
            engine: EngineConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if let Some(database) = &self.database {
            if database.max_connections == 0 {
                anyhow::bail!("Database max_connections must be greater than 0");
            }
        }

        // A wildcard origin cannot be combined with credentials
        if self.cors.allow_credentials
            && (self.cors.allowed_origins.is_empty()
                || self.cors.allowed_origins.iter().any(|o| o == "*"))
        {
            anyhow::bail!("CORS credentials require an explicit list of allowed origins");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        self.engine.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: None,
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: false,
            },
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_credentials_with_wildcard_origin_rejected() {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["*".to_string()];
        config.cors.allow_credentials = true;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        std::env::set_var("TRIBUTARY_PORT", "9191");
        std::env::set_var("DATABASE_URL", "postgresql://localhost/tributary");
        std::env::set_var("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example");

        let config = Config::load().unwrap();
        assert_eq!(config.server.port, 9191);
        assert_eq!(
            config.database.as_ref().map(|d| d.url.as_str()),
            Some("postgresql://localhost/tributary")
        );
        assert_eq!(config.cors.allowed_origins.len(), 2);

        std::env::remove_var("TRIBUTARY_PORT");
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("CORS_ALLOWED_ORIGINS");
    }

    #[test]
    #[serial]
    fn test_missing_database_url_means_memory_store() {
        std::env::remove_var("DATABASE_URL");
        let config = Config::load().unwrap();
        assert!(config.database.is_none());
    }
}
