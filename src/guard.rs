//! Execution guard: the single entry point for slow, fallible AI work.
//!
//! `ExecutionGuard::execute` acquires a limiter slot scoped to
//! `(concurrency_key, user_id)`, runs the operation through the retry executor with a
//! per-attempt deadline, and converts every outcome into a [`GuardResult`]. It never
//! returns an error and never panics on a failing operation; failures are classified,
//! redacted and appended to a bounded failure log.
//!
//! Cancellation is cooperative: each attempt receives an [`AttemptContext`] whose
//! `CancellationToken` is cancelled when the deadline fires. The attempt future itself is
//! dropped at that point; anything it spawned elsewhere should watch the token.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, info_span, warn, Instrument};

use crate::classify::{classify_error, default_should_retry, ErrorCode};
use crate::clock::{Clock, SystemClock};
use crate::concurrency::LimiterRegistry;
use crate::config::{GuardConfig, ReliabilityConfig, RetryConfig};
use crate::error::GuardError;
use crate::phase::PhaseAdjustments;
use crate::retry::Retry;

/// Outcome category reported to call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Success,
    Error,
    Timeout,
    Queued,
    Disabled,
}

/// Structured result of a guarded call. Returned, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardResult<T> {
    pub status: GuardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub message: Option<String>,
    /// Whether the caller may invoke the guard again for the same work
    pub retry_allowed: bool,
    pub error_code: Option<ErrorCode>,
    pub duration_ms: u64,
}

impl<T> GuardResult<T> {
    pub fn success(data: T, duration_ms: u64) -> Self {
        Self {
            status: GuardStatus::Success,
            data: Some(data),
            message: None,
            retry_allowed: false,
            error_code: None,
            duration_ms,
        }
    }

    pub fn failure(
        status: GuardStatus,
        message: impl Into<String>,
        error_code: ErrorCode,
        retry_allowed: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            status,
            data: None,
            message: Some(message.into()),
            retry_allowed,
            error_code: Some(error_code),
            duration_ms,
        }
    }

    /// Backpressure signalled before any work ran (e.g. from the soft rate limiter).
    pub fn queued(message: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::Queued,
            data: None,
            message: Some(message.into()),
            retry_allowed: true,
            error_code: None,
            duration_ms: 0,
        }
    }

    pub fn disabled(message: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::Disabled,
            data: None,
            message: Some(message.into()),
            retry_allowed: false,
            error_code: None,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == GuardStatus::Success
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> GuardResult<U> {
        GuardResult {
            status: self.status,
            data: self.data.map(f),
            message: self.message,
            retry_allowed: self.retry_allowed,
            error_code: self.error_code,
            duration_ms: self.duration_ms,
        }
    }
}

/// Progress events emitted while a guarded call moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardProgress {
    /// All slots are busy; the call is waiting behind `queued_ahead` others
    Waiting { queued_ahead: usize },
    Started,
    /// Attempt `attempt` failed and the next one starts after `delay`
    Retrying { attempt: usize, delay: Duration },
    Finished { status: GuardStatus },
}

type ShouldRetryFn = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;
type ProgressFn = Arc<dyn Fn(&GuardProgress) + Send + Sync>;

/// One guarded invocation.
#[derive(Clone)]
pub struct GuardRequest {
    pub name: String,
    pub user_id: Option<String>,
    pub case_id: Option<String>,
    pub entity_id: Option<String>,
    /// Per-attempt deadline; the guard default applies when unset
    pub timeout: Option<Duration>,
    /// Retries after the first attempt; the guard default applies when unset
    pub retries: Option<usize>,
    pub concurrency_key: String,
    should_retry: Option<ShouldRetryFn>,
    on_progress: Option<ProgressFn>,
}

impl fmt::Debug for GuardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardRequest")
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("case_id", &self.case_id)
            .field("entity_id", &self.entity_id)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("concurrency_key", &self.concurrency_key)
            .field("custom_should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl GuardRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_id: None,
            case_id: None,
            entity_id: None,
            timeout: None,
            retries: None,
            concurrency_key: "default".to_string(),
            should_retry: None,
            on_progress: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = key.into();
        self
    }

    /// Apply a lifecycle phase's timeout and retry budget.
    pub fn with_phase(self, adjustments: &PhaseAdjustments) -> Self {
        self.timeout(adjustments.ai_timeout)
            .retries(adjustments.max_retries)
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&GuardProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    fn emit(&self, event: GuardProgress) {
        if let Some(cb) = &self.on_progress {
            cb(&event);
        }
    }
}

/// Handed to every attempt of a guarded operation.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number
    pub attempt: usize,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl AttemptContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Entry in the failure ring buffer. Messages are redacted before they are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub user_id: Option<String>,
    pub case_id: Option<String>,
    pub entity_id: Option<String>,
    pub error_code: ErrorCode,
    pub message: String,
    pub duration_ms: u64,
}

pub struct ExecutionGuard {
    config: GuardConfig,
    retry: RetryConfig,
    limiters: Arc<LimiterRegistry>,
    failures: Mutex<VecDeque<FailureRecord>>,
    clock: Arc<dyn Clock>,
}

impl ExecutionGuard {
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self::with_parts(
            config.guard.clone(),
            config.retry.clone(),
            Arc::new(LimiterRegistry::new(config.concurrency.clone())),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: GuardConfig,
        retry: RetryConfig,
        limiters: Arc<LimiterRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            retry,
            limiters,
            failures: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }

    /// Run `operation` under the guard.
    pub async fn execute<F, Fut, T>(&self, request: GuardRequest, operation: F) -> GuardResult<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let span = info_span!(
            "ai_guard",
            operation = %request.name,
            user_id = request.user_id.as_deref().unwrap_or("-"),
            case_id = request.case_id.as_deref().unwrap_or("-"),
            concurrency_key = %request.concurrency_key,
        );
        self.execute_inner(request, operation).instrument(span).await
    }

    async fn execute_inner<F, Fut, T>(
        &self,
        request: GuardRequest,
        mut operation: F,
    ) -> GuardResult<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let retries = request.retries.unwrap_or(self.config.default_retries);

        let limiter = self
            .limiters
            .limiter(&request.concurrency_key, request.user_id.as_deref());
        if limiter.active() >= limiter.limit() {
            request.emit(GuardProgress::Waiting {
                queued_ahead: limiter.queued(),
            });
        }

        let outcome: Result<T, BoxError> = match limiter.acquire().await {
            Err(e) => Err(e.into()),
            Ok(_permit) => {
                request.emit(GuardProgress::Started);

                let should_retry: ShouldRetryFn = match request.should_retry.clone() {
                    Some(predicate) => predicate,
                    None => Arc::new(default_should_retry),
                };
                let progress = request.on_progress.clone();
                let retry_config = RetryConfig {
                    max_retries: retries,
                    ..self.retry.clone()
                };

                let root = CancellationToken::new();
                let attempt_fn = |attempt: usize| {
                    let token = root.child_token();
                    let fut = operation(AttemptContext {
                        attempt,
                        timeout,
                        cancel: token.clone(),
                    });
                    async move {
                        match tokio::time::timeout(timeout, fut).await {
                            Ok(result) => result,
                            Err(_) => {
                                token.cancel();
                                warn!(
                                    attempt,
                                    timeout_ms = timeout.as_millis() as u64,
                                    "attempt exceeded deadline"
                                );
                                Err(GuardError::Timeout {
                                    timeout_ms: timeout.as_millis() as u64,
                                }
                                .into())
                            }
                        }
                    }
                };

                let result = Retry::new(retry_config)
                    .should_retry_arc(Some(should_retry))
                    .on_failed_attempt(move |failed| {
                        if let (Some(cb), Some(delay)) = (&progress, failed.delay) {
                            cb(&GuardProgress::Retrying {
                                attempt: failed.attempt_number,
                                delay,
                            });
                        }
                    })
                    .run(attempt_fn)
                    .await;
                root.cancel();
                result
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(data) => {
                info!(duration_ms, "guarded operation succeeded");
                GuardResult::success(data, duration_ms)
            }
            Err(err) => {
                let classified = classify_error(err.as_ref());
                let status = if classified.code == ErrorCode::Timeout {
                    GuardStatus::Timeout
                } else {
                    GuardStatus::Error
                };
                error!(
                    duration_ms,
                    error_code = %classified.code,
                    retryable = classified.retryable,
                    error = %classified.normalized.message,
                    "guarded operation failed"
                );
                self.record_failure(FailureRecord {
                    timestamp: self.clock.now(),
                    operation: request.name.clone(),
                    user_id: request.user_id.clone(),
                    case_id: request.case_id.clone(),
                    entity_id: request.entity_id.clone(),
                    error_code: classified.code,
                    message: classified.normalized.message.clone(),
                    duration_ms,
                });
                GuardResult::failure(
                    status,
                    classified.message,
                    classified.code,
                    classified.retryable,
                    duration_ms,
                )
            }
        };

        request.emit(GuardProgress::Finished {
            status: result.status,
        });
        result
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, VecDeque<FailureRecord>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, record: FailureRecord) {
        let capacity = self.config.failure_log_capacity.max(1);
        let mut log = self.failures();
        while log.len() >= capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Most recent failures, newest first.
    pub fn recent_failures(&self, limit: usize) -> Vec<FailureRecord> {
        self.failures().iter().rev().take(limit).cloned().collect()
    }

    pub fn failures_since(&self, window: Duration) -> Vec<FailureRecord> {
        let cutoff = self.cutoff(window);
        self.failures()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn failure_count_since(&self, window: Duration) -> usize {
        let cutoff = self.cutoff(window);
        self.failures()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .count()
    }

    pub fn failures_for_operation(&self, operation: &str, window: Duration) -> usize {
        let cutoff = self.cutoff(window);
        self.failures()
            .iter()
            .filter(|r| r.operation == operation && r.timestamp >= cutoff)
            .count()
    }

    pub fn failure_log_len(&self) -> usize {
        self.failures().len()
    }

    pub fn clear_failures(&self) {
        self.failures().clear();
    }

    fn cutoff(&self, window: Duration) -> DateTime<Utc> {
        let window =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.clock
            .now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::abort;
    use crate::config::ConcurrencyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> ExecutionGuard {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: false,
            ..RetryConfig::default()
        };
        ExecutionGuard::with_parts(
            GuardConfig::default(),
            retry,
            Arc::new(LimiterRegistry::new(ConcurrencyConfig::default())),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_carries_data() {
        let g = guard();
        let r = g
            .execute(GuardRequest::new("ocr").user("u1"), |_| async {
                Ok::<_, BoxError>("text")
            })
            .await;
        assert_eq!(r.status, GuardStatus::Success);
        assert_eq!(r.data, Some("text"));
        assert!(r.error_code.is_none());
        assert_eq!(g.failure_log_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let g = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let r: GuardResult<()> = g
            .execute(GuardRequest::new("chat").retries(3), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("401 invalid_api_key sk-abcdefghijklmnopqrstuvwx".into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.status, GuardStatus::Error);
        assert_eq!(r.error_code, Some(ErrorCode::AuthError));
        assert!(!r.retry_allowed);

        let failure = &g.recent_failures(1)[0];
        assert_eq!(failure.error_code, ErrorCode::AuthError);
        assert!(!failure.message.contains("abcdefghijklmnopqrstuvwx"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_exhaust_retries_then_allow_caller_retry() {
        let g = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let r: GuardResult<()> = g
            .execute(GuardRequest::new("analysis").retries(2), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("HTTP 429: quota exceeded".into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(r.error_code, Some(ErrorCode::RateLimit));
        assert!(r.retry_allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_timeout_and_cancels_token() {
        let g = guard();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let t = tokens.clone();
        let r: GuardResult<()> = g
            .execute(
                GuardRequest::new("compile")
                    .timeout(Duration::from_millis(100))
                    .retries(1),
                move |ctx| {
                    t.lock().unwrap().push(ctx.cancel.clone());
                    async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                },
            )
            .await;

        assert_eq!(r.status, GuardStatus::Timeout);
        assert_eq!(r.error_code, Some(ErrorCode::Timeout));
        assert!(r.retry_allowed);
        let tokens = tokens.lock().unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_and_progress() {
        let g = guard();
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = events.clone();
        let r: GuardResult<u8> = g
            .execute(
                GuardRequest::new("ocr")
                    .retries(3)
                    .should_retry(|e| !e.to_string().contains("corrupt"))
                    .on_progress(move |p| ev.lock().unwrap().push(p.clone())),
                |ctx| async move {
                    if ctx.attempt == 1 {
                        Err("ECONNRESET".into())
                    } else {
                        Err("corrupt pdf".into())
                    }
                },
            )
            .await;

        assert_eq!(r.status, GuardStatus::Error);
        let events = events.lock().unwrap();
        assert_eq!(events[0], GuardProgress::Started);
        assert!(matches!(events[1], GuardProgress::Retrying { attempt: 1, .. }));
        assert_eq!(
            events.last(),
            Some(&GuardProgress::Finished {
                status: GuardStatus::Error
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abort_short_circuits() {
        let g = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let r: GuardResult<()> = g
            .execute(GuardRequest::new("ocr"), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(abort("document removed"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.error_code, Some(ErrorCode::Aborted));
        assert!(!r.retry_allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_log_is_bounded() {
        let g = guard();
        for i in 0..105 {
            let _: GuardResult<()> = g
                .execute(GuardRequest::new(format!("op-{i}")).retries(0), |_| async {
                    Err("boom".into())
                })
                .await;
        }
        assert_eq!(g.failure_log_len(), 100);
        let newest = g.recent_failures(1);
        assert_eq!(newest[0].operation, "op-104");
        assert_eq!(g.failures_for_operation("op-0", Duration::from_secs(3600)), 0);
        assert_eq!(g.failure_count_since(Duration::from_secs(3600)), 100);
    }

    #[test]
    fn phase_adjustments_apply_to_request() {
        let adj = crate::config::PhaseConfig::default().intake;
        let req = GuardRequest::new("ocr").with_phase(&adj);
        assert_eq!(req.timeout, Some(Duration::from_secs(120)));
        assert_eq!(req.retries, Some(5));
    }
}
