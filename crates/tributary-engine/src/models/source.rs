//! Data source registration model

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::conflict::{ConflictStrategy, DuplicateDetection};
use super::mapping::DataMapping;
use crate::retry::RetryPolicy;

const REDACTED: &str = "********";

/// Lifecycle status of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Active,
    Inactive,
    Error,
    Maintenance,
    Deprecated,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Error => "error",
            SourceStatus::Maintenance => "maintenance",
            SourceStatus::Deprecated => "deprecated",
        }
    }

    /// Whether runs may be admitted for a source in this status
    pub fn can_sync(&self) -> bool {
        matches!(self, SourceStatus::Active | SourceStatus::Error)
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    RestApi,
    Graphql,
    Database,
    File,
    MessageFeed,
    Webhook,
}

impl DataSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::RestApi => "rest_api",
            DataSourceType::Graphql => "graphql",
            DataSourceType::Database => "database",
            DataSourceType::File => "file",
            DataSourceType::MessageFeed => "message_feed",
            DataSourceType::Webhook => "webhook",
        }
    }
}

/// Wire format of the provider payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    Json,
    Ndjson,
    Csv,
    Xml,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_page_param() -> String {
    "cursor".to_string()
}

fn default_page_size_param() -> String {
    "limit".to_string()
}

fn default_replay_window() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestApiConfig {
    pub endpoint: String,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Dotted path to the record array in a response body; the body itself when unset
    #[serde(default)]
    pub records_path: Option<String>,
    /// Dotted path to the next page token in a response body
    #[serde(default)]
    pub cursor_path: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    /// Query parameter carrying the incremental lower bound
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlConfig {
    pub endpoint: String,
    pub query: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub cursor_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub connection_url: String,
    pub query: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub cursor_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub path: String,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFeedConfig {
    pub broker_url: String,
    pub topic: String,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub secret_key: String,
    #[serde(default = "default_replay_window")]
    pub replay_window_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Per-family connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfiguration {
    RestApi(RestApiConfig),
    Graphql(GraphqlConfig),
    Database(DatabaseConfig),
    File(FileConfig),
    MessageFeed(MessageFeedConfig),
    Webhook(WebhookConfig),
}

impl SourceConfiguration {
    pub fn source_type(&self) -> DataSourceType {
        match self {
            SourceConfiguration::RestApi(_) => DataSourceType::RestApi,
            SourceConfiguration::Graphql(_) => DataSourceType::Graphql,
            SourceConfiguration::Database(_) => DataSourceType::Database,
            SourceConfiguration::File(_) => DataSourceType::File,
            SourceConfiguration::MessageFeed(_) => DataSourceType::MessageFeed,
            SourceConfiguration::Webhook(_) => DataSourceType::Webhook,
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            SourceConfiguration::RestApi(c) => c.batch_size,
            SourceConfiguration::Graphql(c) => c.batch_size,
            SourceConfiguration::Database(c) => c.batch_size,
            SourceConfiguration::File(c) => c.batch_size,
            SourceConfiguration::MessageFeed(c) => c.batch_size,
            SourceConfiguration::Webhook(c) => c.batch_size,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        match self {
            SourceConfiguration::RestApi(c) => c.timeout_secs,
            SourceConfiguration::Graphql(c) => c.timeout_secs,
            SourceConfiguration::Database(c) => c.timeout_secs,
            SourceConfiguration::File(c) => c.timeout_secs,
            SourceConfiguration::MessageFeed(c) => c.timeout_secs,
            SourceConfiguration::Webhook(_) => default_timeout_secs(),
        }
    }

    /// Structural checks performed at registration time
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size() == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        match self {
            SourceConfiguration::RestApi(RestApiConfig { endpoint, .. })
            | SourceConfiguration::Graphql(GraphqlConfig { endpoint, .. }) => {
                reqwest::Url::parse(endpoint)
                    .map_err(|e| format!("invalid endpoint '{endpoint}': {e}"))?;
            }
            SourceConfiguration::Database(c) => {
                if c.connection_url.trim().is_empty() || c.query.trim().is_empty() {
                    return Err("database sources need a connection_url and a query".to_string());
                }
            }
            SourceConfiguration::File(c) => {
                if c.path.trim().is_empty() {
                    return Err("file sources need a path".to_string());
                }
            }
            SourceConfiguration::MessageFeed(c) => {
                if c.broker_url.trim().is_empty() || c.topic.trim().is_empty() {
                    return Err("message feeds need a broker_url and a topic".to_string());
                }
            }
            SourceConfiguration::Webhook(c) => {
                if c.secret_key.len() < 16 {
                    return Err("webhook secret_key must be at least 16 bytes".to_string());
                }
            }
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        match self {
            SourceConfiguration::Webhook(c) => SourceConfiguration::Webhook(WebhookConfig {
                secret_key: REDACTED.to_string(),
                ..c.clone()
            }),
            SourceConfiguration::Database(c) => SourceConfiguration::Database(DatabaseConfig {
                connection_url: REDACTED.to_string(),
                ..c.clone()
            }),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Credentials declared for a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authentication {
    #[default]
    None,
    ApiKey {
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Config),
}

impl Authentication {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authentication::None => "none",
            Authentication::ApiKey { .. } => "api_key",
            Authentication::Basic { .. } => "basic",
            Authentication::Bearer { .. } => "bearer",
            Authentication::OAuth2(_) => "oauth2",
        }
    }

    fn redacted(&self) -> Self {
        match self {
            Authentication::None => Authentication::None,
            Authentication::ApiKey { header, .. } => Authentication::ApiKey {
                header: header.clone(),
                key: REDACTED.to_string(),
            },
            Authentication::Basic { username, .. } => Authentication::Basic {
                username: username.clone(),
                password: REDACTED.to_string(),
            },
            Authentication::Bearer { expires_at, .. } => Authentication::Bearer {
                token: REDACTED.to_string(),
                expires_at: *expires_at,
            },
            Authentication::OAuth2(c) => Authentication::OAuth2(OAuth2Config {
                client_secret: REDACTED.to_string(),
                refresh_token: c.refresh_token.as_ref().map(|_| REDACTED.to_string()),
                ..c.clone()
            }),
        }
    }
}

/// How often a source is synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    RealTime,
    EveryMinute,
    #[serde(rename = "every_5_minutes")]
    Every5Minutes,
    #[serde(rename = "every_15_minutes")]
    Every15Minutes,
    #[serde(rename = "every_30_minutes")]
    Every30Minutes,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    #[default]
    Manual,
}

/// How a run merges incoming records into canonical state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullSync,
    #[default]
    Incremental,
    Differential,
    Merge,
    Replace,
    Append,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FullSync => "full_sync",
            SyncMode::Incremental => "incremental",
            SyncMode::Differential => "differential",
            SyncMode::Merge => "merge",
            SyncMode::Replace => "replace",
            SyncMode::Append => "append",
        }
    }

    /// Modes that resume from the persisted cursor
    pub fn resumes_from_cursor(&self) -> bool {
        matches!(self, SyncMode::Incremental | SyncMode::Differential)
    }
}

/// Calendar schedule overriding the frequency's default cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Six or seven field cron expression, evaluated in `timezone`
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub excluded_weekdays: Vec<Weekday>,
    #[serde(default)]
    pub excluded_days_of_month: Vec<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            cron: None,
            timezone: default_timezone(),
            excluded_weekdays: Vec::new(),
            excluded_days_of_month: Vec::new(),
        }
    }
}

/// Body of a schedule change; `schedule` replaces the calendar schedule outright
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub frequency: Option<SyncFrequency>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

fn default_run_timeout_secs() -> u64 {
    3600
}

fn default_source_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub frequency: SyncFrequency,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub mode: SyncMode,
    /// Strategy applied to every field without an override; `manual_review` when unset
    #[serde(default)]
    pub conflict_resolution: Option<ConflictStrategy>,
    #[serde(default)]
    pub field_strategies: BTreeMap<String, ConflictStrategy>,
    /// Overrides the configuration's page size
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Per remote call timeout; falls back to the configuration's timeout
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Declared trust in this source, used by `highest_confidence`
    #[serde(default = "default_source_confidence")]
    pub source_confidence: f64,
    #[serde(default)]
    pub duplicate_detection: Option<DuplicateDetection>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            frequency: SyncFrequency::default(),
            schedule: None,
            mode: SyncMode::default(),
            conflict_resolution: None,
            field_strategies: BTreeMap::new(),
            batch_size: None,
            call_timeout_secs: None,
            run_timeout_secs: default_run_timeout_secs(),
            max_pages: None,
            retry_policy: RetryPolicy::default(),
            source_confidence: default_source_confidence(),
            duplicate_detection: None,
        }
    }
}

impl SyncSettings {
    /// Bounds checked at registration and on every settings patch
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == Some(0) {
            return Err("batch_size must be greater than 0".to_string());
        }
        if self.call_timeout_secs == Some(0) {
            return Err("call_timeout_secs must be greater than 0".to_string());
        }
        if self.run_timeout_secs == 0 {
            return Err("run_timeout_secs must be greater than 0".to_string());
        }
        if self.max_pages == Some(0) {
            return Err("max_pages must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.source_confidence) {
            return Err("source_confidence must be within [0, 1]".to_string());
        }
        Ok(())
    }

    pub fn strategy_for(&self, field: &str) -> ConflictStrategy {
        self.field_strategies
            .get(field)
            .copied()
            .or(self.conflict_resolution)
            .unwrap_or_default()
    }
}

/// Outbound call budget for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RateLimits {
    #[serde(default)]
    pub per_second: Option<u32>,
    #[serde(default)]
    pub per_minute: Option<u32>,
    #[serde(default)]
    pub per_hour: Option<u32>,
    #[serde(default)]
    pub per_day: Option<u32>,
    /// Bucket capacity for the per-second window; defaults to the per-second rate
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
}

/// A registered external data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub provider: String,
    #[serde(rename = "type")]
    pub source_type: DataSourceType,
    pub configuration: SourceConfiguration,
    pub authentication: Authentication,
    pub sync_settings: SyncSettings,
    pub data_mapping: DataMapping,
    pub rate_limits: RateLimits,
    pub status: SourceStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_sync: Option<DateTime<Utc>>,
    /// Page token persisted by the last completed incremental run
    pub sync_cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    pub fn from_request(request: CreateDataSource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            provider: request.provider,
            source_type: request.configuration.source_type(),
            configuration: request.configuration,
            authentication: request.authentication,
            sync_settings: request.sync_settings,
            data_mapping: request.data_mapping,
            rate_limits: request.rate_limits,
            status: request.status.unwrap_or_default(),
            last_sync: None,
            next_sync: None,
            sync_cursor: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.sync_settings
            .batch_size
            .unwrap_or_else(|| self.configuration.batch_size())
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.sync_settings
                .call_timeout_secs
                .unwrap_or_else(|| self.configuration.timeout_secs()),
        )
    }

    pub fn run_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_settings.run_timeout_secs)
    }

    /// Record a completed run, keeping `last_sync <= next_sync`
    pub fn record_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
        if let Some(next) = self.next_sync {
            if next < at {
                self.next_sync = Some(at);
            }
        }
    }

    /// Set the next eligible run time, clamped to not precede `last_sync`
    pub fn set_next_sync(&mut self, next: Option<DateTime<Utc>>) {
        self.next_sync = match (next, self.last_sync) {
            (Some(next), Some(last)) if next < last => Some(last),
            (next, _) => next,
        };
    }

    /// Copy safe to return over the API: secrets are masked
    pub fn redacted(&self) -> Self {
        Self {
            configuration: self.configuration.redacted(),
            authentication: self.authentication.redacted(),
            ..self.clone()
        }
    }
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataSource {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub provider: String,
    pub configuration: SourceConfiguration,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub sync_settings: SyncSettings,
    pub data_mapping: DataMapping,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub status: Option<SourceStatus>,
}

/// Partial update; unset fields are left as they are
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourcePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub configuration: Option<SourceConfiguration>,
    #[serde(default)]
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub sync_settings: Option<SyncSettings>,
    #[serde(default)]
    pub data_mapping: Option<DataMapping>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
    #[serde(default)]
    pub status: Option<SourceStatus>,
}

impl DataSourcePatch {
    pub fn apply(self, source: &mut DataSource) {
        if let Some(name) = self.name {
            source.name = name;
        }
        if let Some(description) = self.description {
            source.description = Some(description);
        }
        if let Some(configuration) = self.configuration {
            source.source_type = configuration.source_type();
            source.configuration = configuration;
        }
        if let Some(authentication) = self.authentication {
            source.authentication = authentication;
        }
        if let Some(sync_settings) = self.sync_settings {
            source.sync_settings = sync_settings;
        }
        if let Some(data_mapping) = self.data_mapping {
            source.data_mapping = data_mapping;
        }
        if let Some(rate_limits) = self.rate_limits {
            source.rate_limits = rate_limits;
        }
        if let Some(status) = self.status {
            source.status = status;
        }
        source.updated_at = Utc::now();
    }

    /// Whether the patch touches anything the mapper compiles
    pub fn changes_mapping(&self) -> bool {
        self.data_mapping.is_some() || self.configuration.is_some()
    }
}

/// Filters for listing sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFilter {
    #[serde(default)]
    pub status: Option<SourceStatus>,
    #[serde(default, rename = "type")]
    pub source_type: Option<DataSourceType>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub include_deprecated: bool,
}

impl SourceFilter {
    pub fn matches(&self, source: &DataSource) -> bool {
        if !self.include_deprecated
            && source.status == SourceStatus::Deprecated
            && self.status != Some(SourceStatus::Deprecated)
        {
            return false;
        }
        self.status.is_none_or(|s| s == source.status)
            && self.source_type.is_none_or(|t| t == source.source_type)
            && self
                .provider
                .as_deref()
                .is_none_or(|p| p.eq_ignore_ascii_case(&source.provider))
    }
}

/// Labels attached to a source's metrics and alerts
pub fn source_labels(source: &DataSource) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("source_id", source.id.to_string()),
        ("provider", source.provider.clone()),
        ("type", source.source_type.as_str().to_string()),
    ])
}
