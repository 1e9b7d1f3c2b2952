pub mod http;
pub mod throttle;

use crate::error::FetchError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use throttle::{RateLimit, Throttle};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_JITTER: f64 = 0.25;

/// Exponential backoff with multiplicative jitter.
///
/// The delay after the n-th failed attempt is
/// `min(base * multiplier^(n-1), max) * U[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `failed_attempt + 1`, without jitter.
    pub fn nominal_backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let nominal = self.nominal_backoff(failed_attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }
}

/// Wraps every call to one upstream: shared throttle first, then retry of transient failures.
///
/// One instance exists per upstream and is shared by all ticker tasks through an `Arc`, so the
/// throttle bounds the aggregate call rate of the whole process.
#[derive(Debug, Clone)]
pub struct RateLimitedFetcher {
    throttle: Arc<Throttle>,
    policy: RetryPolicy,
}

impl RateLimitedFetcher {
    pub fn new(throttle: Arc<Throttle>, policy: RetryPolicy) -> Self {
        Self { throttle, policy }
    }

    pub fn source_name(&self) -> &str {
        self.throttle.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt cap is reached.
    ///
    /// Each attempt, including retries, takes one throttle slot.
    pub async fn fetch<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.throttle.acquire().await;

            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(err) => err,
            };

            let retry_after = match &err {
                FetchError::Transient { retry_after, .. } => *retry_after,
                _ => return Err(err),
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    source_name = %self.source_name(),
                    what,
                    attempts = attempt,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(FetchError::ExhaustedRetries {
                    source_name: self.source_name().to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let mut backoff = self.policy.backoff(attempt);
            if let Some(after) = retry_after {
                backoff = backoff.max(after);
            }
            tracing::warn!(
                source_name = %self.source_name(),
                what,
                attempt,
                ?backoff,
                error = %err,
                "fetch failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
