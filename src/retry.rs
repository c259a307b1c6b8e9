//! Retry mechanism with exponential backoff
//!
//! Provides retry logic for transient failures of guarded operations. The delay before
//! retry *i* is `initial_delay * multiplier^i`, clamped to `[initial_delay, max_delay]`,
//! then scaled by a random factor in `[0.75, 1.25]` and clamped again, so jitter never
//! escapes the configured bounds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tower::BoxError;
use tracing::{debug, warn};

use crate::classify::is_abort;
use crate::config::RetryConfig;
use crate::redact::redact_secrets;

const JITTER_RATIO: f64 = 0.25;

/// Retry policy for operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Check if we should retry
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    /// Number of retries consumed so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn retries_left(&self) -> usize {
        self.config.max_retries.saturating_sub(self.attempt)
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let min = self.config.initial_delay;
        let max = self.config.max_delay.max(min);
        let exp = attempt.min(i32::MAX as usize) as i32;
        let scaled = min.as_secs_f64() * self.config.backoff_multiplier.powi(exp);
        if !scaled.is_finite() || scaled >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(scaled).clamp(min, max)
    }

    /// Delay before retry number `attempt` with jitter applied from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: usize, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter {
            return base;
        }
        let min = self.config.initial_delay;
        let max = self.config.max_delay.max(min);
        let factor = 1.0 + rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
        base.mul_f64(factor).clamp(min, max)
    }

    /// Calculate next delay and advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_with(self.attempt, &mut rand::thread_rng());
        self.attempt += 1;
        delay
    }

    /// Reset the retry policy
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Information handed to `on_failed_attempt` callbacks.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    /// 1-based number of the attempt that just failed
    pub attempt_number: usize,
    pub retries_left: usize,
    /// Sleep before the next attempt; `None` when no further attempt will run
    pub delay: Option<Duration>,
    /// Redacted error message
    pub message: String,
}

type ShouldRetryFn = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;
type OnFailedAttemptFn = Arc<dyn Fn(&FailedAttempt) + Send + Sync>;

/// Builder for retry operations
#[derive(Clone)]
pub struct Retry {
    config: RetryConfig,
    should_retry: Option<ShouldRetryFn>,
    on_failed_attempt: Option<OnFailedAttemptFn>,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
            on_failed_attempt: None,
        }
    }

    pub fn max_retries(mut self, max: usize) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    /// Predicate consulted after each failure; `false` stops retrying.
    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub(crate) fn should_retry_arc(mut self, f: Option<ShouldRetryFn>) -> Self {
        self.should_retry = f;
        self
    }

    pub fn on_failed_attempt<F>(mut self, f: F) -> Self
    where
        F: Fn(&FailedAttempt) + Send + Sync + 'static,
    {
        self.on_failed_attempt = Some(Arc::new(f));
        self
    }

    /// Run `operation` until it succeeds, aborts, is rejected by the predicate, or
    /// exhausts its retries. The last error is returned unchanged.
    pub async fn run<F, Fut, T>(self, mut operation: F) -> Result<T, BoxError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let mut policy = RetryPolicy::new(self.config);
        loop {
            let attempt_number = policy.attempt() + 1;
            let error = match operation(attempt_number).await {
                Ok(result) => {
                    if attempt_number > 1 {
                        debug!(attempts = attempt_number, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            let message = redact_secrets(&error.to_string());
            let retryable = !is_abort(&error)
                && self.should_retry.as_ref().map_or(true, |p| p(&error));

            if !retryable || !policy.should_retry() {
                if retryable {
                    warn!(
                        max_retries = policy.config().max_retries,
                        error = %message,
                        "max retries exceeded"
                    );
                } else {
                    debug!(error = %message, "non-retryable error");
                }
                if let Some(cb) = &self.on_failed_attempt {
                    cb(&FailedAttempt {
                        attempt_number,
                        retries_left: 0,
                        delay: None,
                        message,
                    });
                }
                return Err(error);
            }

            let delay = policy.next_delay();
            warn!(
                attempt = attempt_number,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "attempt failed, retrying"
            );
            if let Some(cb) = &self.on_failed_attempt {
                cb(&FailedAttempt {
                    attempt_number,
                    retries_left: policy.retries_left(),
                    delay: Some(delay),
                    message,
                });
            }

            sleep(delay).await;
        }
    }
}

/// Retry an async operation with the given configuration and default predicate.
pub async fn retry_async<F, Fut, T>(operation: F, config: RetryConfig) -> Result<T, BoxError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    Retry::new(config).run(operation).await
}
