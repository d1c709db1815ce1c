//! Credential store
//!
//! Holds the credential of every registered source, refreshes OAuth2 tokens shortly
//! before they expire and reports per-source authentication health. Runs never read
//! [`Authentication`] directly; they call [`CredentialStore::ensure`] with their
//! configuration snapshot and receive a ready-to-use [`Credential`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::rest::retry_after;
use crate::adapter::AdapterError;
use crate::error::{IntegrationError, Result};
use crate::models::{Authentication, OAuth2Config};
use crate::retry::{CallStats, Idempotency, RetryExecutor};

/// Credential material attached to outbound calls
#[derive(Clone, PartialEq)]
pub enum Credential {
    Anonymous,
    ApiKey { header: String, key: String },
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::ApiKey { header, .. } => write!(f, "ApiKey({header})"),
            Credential::Basic { username, .. } => write!(f, "Basic({username})"),
            Credential::Bearer { .. } => f.write_str("Bearer(..)"),
        }
    }
}

impl Credential {
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Anonymous => builder,
            Credential::ApiKey { header, key } => builder.header(header.as_str(), key.as_str()),
            Credential::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credential::Bearer { token } => builder.bearer_auth(token),
        }
    }
}

/// Access token issued by an authorization server
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

/// Obtains OAuth2 access tokens
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Use the refresh token when one is known, the client credentials otherwise
    async fn fetch_token(
        &self,
        config: &OAuth2Config,
        refresh_token: Option<&str>,
    ) -> std::result::Result<AccessToken, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// `client_credentials` / `refresh_token` grant client
pub struct OAuthTokenClient {
    client: reqwest::Client,
}

impl OAuthTokenClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenClient {
    async fn fetch_token(
        &self,
        config: &OAuth2Config,
        refresh_token: Option<&str>,
    ) -> std::result::Result<AccessToken, AdapterError> {
        let scope = config.scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        match refresh_token {
            Some(token) => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", token));
            }
            None => form.push(("grant_type", "client_credentials")),
        }
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .client
            .post(&config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("token endpoint answered {status}");
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => AdapterError::Auth(message),
                StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
                    retry_after: retry_after(&response),
                },
                StatusCode::REQUEST_TIMEOUT => AdapterError::Transient(message),
                s if s.is_server_error() => AdapterError::Transient(message),
                _ => AdapterError::Unsupported(message),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        Ok(AccessToken {
            access_token: body.access_token,
            expires_at: body.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            refresh_token: body.refresh_token,
        })
    }
}

/// Authentication health of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthHealth {
    #[default]
    Unknown,
    Healthy,
    Failed,
}

struct CredentialEntry {
    authentication: Authentication,
    token: Option<AccessToken>,
    /// Forces a refresh on the next `ensure`
    stale: bool,
}

impl CredentialEntry {
    fn new(authentication: Authentication) -> Self {
        Self {
            authentication,
            token: None,
            stale: false,
        }
    }
}

type Slot = Arc<Mutex<CredentialEntry>>;

/// Keep the identity provider's rejection as an auth failure of the source
fn token_error(source_id: Uuid, err: IntegrationError) -> IntegrationError {
    match err {
        IntegrationError::Adapter(AdapterError::Auth(message)) => IntegrationError::Auth { source_id, message },
        other => other,
    }
}

/// Shared credential state for all sources
///
/// Each source has its own slot; a token fetch only holds that source's slot, so a
/// slow identity provider never delays credentials of other sources.
pub struct CredentialStore {
    entries: RwLock<HashMap<Uuid, Slot>>,
    health: RwLock<HashMap<Uuid, AuthHealth>>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew: Duration,
}

impl CredentialStore {
    pub fn new(refresher: Arc<dyn TokenRefresher>, refresh_skew: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            refresher,
            refresh_skew,
        }
    }

    /// Register or replace the credential of a source
    pub async fn register(&self, source_id: Uuid, authentication: Authentication) {
        self.entries
            .write()
            .await
            .insert(source_id, Arc::new(Mutex::new(CredentialEntry::new(authentication))));
        self.health.write().await.remove(&source_id);
    }

    pub async fn remove(&self, source_id: Uuid) {
        self.entries.write().await.remove(&source_id);
        self.health.write().await.remove(&source_id);
    }

    /// Mark the cached token unusable after the provider rejected it
    pub async fn invalidate(&self, source_id: Uuid) {
        let slot = self.entries.read().await.get(&source_id).cloned();
        if let Some(slot) = slot {
            slot.lock().await.stale = true;
        }
    }

    pub async fn health(&self, source_id: Uuid) -> AuthHealth {
        self.health
            .read()
            .await
            .get(&source_id)
            .copied()
            .unwrap_or_default()
    }

    async fn slot(&self, source_id: Uuid, authentication: &Authentication) -> Slot {
        if let Some(slot) = self.entries.read().await.get(&source_id) {
            return slot.clone();
        }
        self.entries
            .write()
            .await
            .entry(source_id)
            .or_insert_with(|| Arc::new(Mutex::new(CredentialEntry::new(authentication.clone()))))
            .clone()
    }

    /// Produce a usable credential for `authentication`, refreshing when needed
    ///
    /// Token requests go through `executor`, so they share the source's retry policy
    /// and per-call timeout and are counted in `stats`.
    pub async fn ensure(
        &self,
        source_id: Uuid,
        authentication: &Authentication,
        executor: &RetryExecutor,
        stats: &mut CallStats,
    ) -> Result<Credential> {
        let slot = self.slot(source_id, authentication).await;
        let outcome = {
            let mut entry = slot.lock().await;
            if entry.authentication != *authentication {
                *entry = CredentialEntry::new(authentication.clone());
            }
            self.resolve(source_id, &mut entry, executor, stats).await
        };

        let health = if outcome.is_ok() {
            AuthHealth::Healthy
        } else {
            AuthHealth::Failed
        };
        self.health.write().await.insert(source_id, health);
        outcome
    }

    async fn resolve(
        &self,
        source_id: Uuid,
        entry: &mut CredentialEntry,
        executor: &RetryExecutor,
        stats: &mut CallStats,
    ) -> Result<Credential> {
        let auth_error = |message: String| IntegrationError::Auth { source_id, message };

        match &entry.authentication {
            Authentication::None => Ok(Credential::Anonymous),
            Authentication::ApiKey { header, key } => Ok(Credential::ApiKey {
                header: header.clone(),
                key: key.clone(),
            }),
            Authentication::Basic { username, password } => Ok(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            Authentication::Bearer { token, expires_at } => {
                if entry.stale || expires_at.is_some_and(|at| at <= Utc::now()) {
                    return Err(auth_error("static bearer token expired and cannot be refreshed".to_string()));
                }
                Ok(Credential::Bearer {
                    token: token.clone(),
                })
            }
            Authentication::OAuth2(config) => {
                let needs_refresh = entry.stale
                    || match &entry.token {
                        None => true,
                        Some(token) => token
                            .expires_at
                            .is_some_and(|at| at - self.refresh_skew <= Utc::now()),
                    };

                if needs_refresh {
                    let refresh_token = entry
                        .token
                        .as_ref()
                        .and_then(|t| t.refresh_token.clone())
                        .or_else(|| config.refresh_token.clone());

                    debug!(source_id = %source_id, "refreshing access token");
                    let fetched = executor
                        .execute(Idempotency::Idempotent, stats, || {
                            self.refresher.fetch_token(config, refresh_token.as_deref())
                        })
                        .await;
                    let token = match fetched {
                        Ok(token) => token,
                        Err(IntegrationError::Adapter(AdapterError::Auth(e))) if refresh_token.is_some() => {
                            warn!(source_id = %source_id, error = %e, "refresh grant failed, retrying with client credentials");
                            executor
                                .execute(Idempotency::Idempotent, stats, || {
                                    self.refresher.fetch_token(config, None)
                                })
                                .await
                                .map_err(|e| token_error(source_id, e))?
                        }
                        Err(e) => return Err(token_error(source_id, e)),
                    };

                    info!(source_id = %source_id, expires_at = ?token.expires_at, "access token refreshed");
                    entry.token = Some(token);
                    entry.stale = false;
                }

                entry
                    .token
                    .as_ref()
                    .map(|t| Credential::Bearer {
                        token: t.access_token.clone(),
                    })
                    .ok_or_else(|| auth_error("no access token available".to_string()))
            }
        }
    }
}
