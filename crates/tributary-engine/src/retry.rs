//! Retry executor with exponential backoff
//!
//! Every outbound adapter call goes through [`RetryExecutor::execute`]: it waits for a
//! rate-limit token, bounds the call by the per-call timeout and retries retryable
//! failures of idempotent calls. Provider reset hints (`Retry-After`) are honoured
//! as given; otherwise the delay grows exponentially with ±25% jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapter::AdapterError;
use crate::error::{IntegrationError, Result};
use crate::rate_limit::RateLimiter;

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    crate::config::DEFAULT_MAX_RETRIES
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Backoff policy declared per source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let spread = capped * 0.25;
            (capped + rand::thread_rng().gen_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Whether a call may be repeated safely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// Counters accumulated across calls of one run
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStats {
    pub api_calls: u32,
    pub retries: u32,
    pub rate_limit_wait: Duration,
}

/// Executes adapter calls under a source's rate limiter and retry policy
pub struct RetryExecutor {
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, limiter: Arc<RateLimiter>, call_timeout: Duration) -> Self {
        Self {
            policy,
            limiter,
            call_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call`, retrying retryable failures of idempotent calls
    ///
    /// After `max_retries` retries the last error becomes
    /// [`IntegrationError::RetriesExhausted`]. Non-retryable errors are returned as is.
    pub async fn execute<T, F, Fut>(
        &self,
        idempotency: Idempotency,
        stats: &mut CallStats,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AdapterError>>,
    {
        let mut retries = 0u32;

        loop {
            let outcome = match self.limiter.acquire(self.call_timeout).await {
                Ok(permit) => {
                    stats.rate_limit_wait += permit.waited;
                    stats.api_calls += 1;
                    let outcome = tokio::time::timeout(self.call_timeout, call())
                        .await
                        .unwrap_or(Err(AdapterError::Timeout(self.call_timeout)));
                    drop(permit);
                    outcome
                }
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if idempotency == Idempotency::NonIdempotent || !err.is_retryable() {
                return Err(err.into());
            }

            if retries >= self.policy.max_retries {
                warn!(
                    kind = %err.kind(),
                    retries,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(IntegrationError::RetriesExhausted {
                    kind: err.kind(),
                    attempts: retries + 1,
                    message: err.to_string(),
                });
            }

            retries += 1;
            stats.retries += 1;
            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.policy.backoff(retries));
            debug!(
                kind = %err.kind(),
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "retrying adapter call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy {
                max_retries,
                jitter: false,
                ..RetryPolicy::default()
            },
            Arc::new(RateLimiter::unlimited()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.backoff(1).as_millis();
            assert!((750..=1_250).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_call_fails_after_exactly_max_retries() {
        let calls = AtomicU32::new(0);
        let mut stats = CallStats::default();

        let result: Result<()> = executor(3)
            .execute(Idempotency::Idempotent, &mut stats, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::RateLimited { retry_after: None }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.retries, 3);
        match result {
            Err(IntegrationError::RetriesExhausted { kind, attempts, .. }) => {
                assert_eq!(kind, ErrorKind::RateLimitExceeded);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_hint_is_used_as_delay() {
        let calls = AtomicU32::new(0);
        let mut stats = CallStats::default();
        let started = tokio::time::Instant::now();

        let value = executor(3)
            .execute(Idempotency::Idempotent, &mut stats, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AdapterError::RateLimited {
                            retry_after: Some(Duration::from_secs(7)),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_calls_are_not_retried() {
        let calls = AtomicU32::new(0);
        let mut stats = CallStats::default();

        let result: Result<()> = executor(3)
            .execute(Idempotency::NonIdempotent, &mut stats, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Transient("connection reset".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test]
    async fn test_auth_errors_are_returned_immediately() {
        let mut stats = CallStats::default();
        let result: Result<()> = executor(3)
            .execute(Idempotency::Idempotent, &mut stats, || async {
                Err(AdapterError::Auth("token expired".to_string()))
            })
            .await;

        assert!(matches!(result, Err(IntegrationError::Adapter(AdapterError::Auth(_)))));
        assert_eq!(stats.api_calls, 1);
    }
}
