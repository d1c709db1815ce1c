//! Per-source outbound call budget
//!
//! Each declared window (second, minute, hour, day) is a token bucket; a call needs
//! one token from every bucket. `max_concurrent` is enforced with a semaphore whose
//! permit is held for the duration of the call.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::adapter::AdapterError;
use crate::models::RateLimits;

/// Token bucket for one window
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, per: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            tokens: capacity,
            max_tokens: capacity,
            refill_rate: capacity / per.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn with_burst(mut self, burst: u32) -> Self {
        self.max_tokens = f64::from(burst.max(1));
        self.tokens = self.max_tokens;
        self
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Permit for one outbound call
pub struct CallPermit {
    _concurrency: Option<OwnedSemaphorePermit>,
    pub waited: Duration,
}

/// Rate limiter shared by every run of one source
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<Vec<TokenBucket>>,
    concurrency: Option<Arc<Semaphore>>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let mut buckets = Vec::new();

        if let Some(per_second) = limits.per_second {
            let bucket = TokenBucket::new(per_second, Duration::from_secs(1));
            buckets.push(match limits.burst {
                Some(burst) => bucket.with_burst(burst),
                None => bucket,
            });
        }
        if let Some(per_minute) = limits.per_minute {
            buckets.push(TokenBucket::new(per_minute, Duration::from_secs(60)));
        }
        if let Some(per_hour) = limits.per_hour {
            buckets.push(TokenBucket::new(per_hour, Duration::from_secs(3600)));
        }
        if let Some(per_day) = limits.per_day {
            buckets.push(TokenBucket::new(per_day, Duration::from_secs(86_400)));
        }

        Self {
            buckets: Mutex::new(buckets),
            concurrency: limits
                .max_concurrent
                .map(|n| Arc::new(Semaphore::new(n.max(1) as usize))),
            limits,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(RateLimits::default())
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Take one token from every bucket, or report how long until that is possible
    async fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        for bucket in buckets.iter_mut() {
            bucket.refill(now);
        }

        let wait = buckets
            .iter()
            .map(TokenBucket::wait_time)
            .max()
            .unwrap_or(Duration::ZERO);

        if wait.is_zero() {
            for bucket in buckets.iter_mut() {
                bucket.tokens -= 1.0;
            }
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Wait for a token, giving up once `timeout` would be exceeded
    pub async fn acquire(&self, timeout: Duration) -> std::result::Result<CallPermit, AdapterError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let concurrency = match &self.concurrency {
            Some(semaphore) => {
                let permit = tokio::time::timeout_at(deadline, semaphore.clone().acquire_owned())
                    .await
                    .map_err(|_| AdapterError::Timeout(timeout))?
                    .map_err(|_| AdapterError::Transient("rate limiter closed".to_string()))?;
                Some(permit)
            }
            None => None,
        };

        loop {
            match self.try_acquire().await {
                Ok(()) => {
                    return Ok(CallPermit {
                        _concurrency: concurrency,
                        waited: started.elapsed(),
                    })
                }
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(AdapterError::Timeout(timeout));
                    }
                    trace!(wait_ms = wait.as_millis() as u64, "waiting for rate limit token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
