//! # AI execution reliability layer
//!
//! Wraps every call to a slow, fallible AI backend (OCR, document analysis, chat,
//! document compilation) with concurrency control, per-attempt deadlines, retry with
//! backoff, error classification with secret redaction, soft rate limiting, per-user
//! budget tracking, lifecycle-phase tuning and operational alerting.
//!
//! ## Core Concepts
//!
//! - **ExecutionGuard**: runs an operation under a per-`(key, user)` limiter, deadline and
//!   retry policy and always returns a [`GuardResult`], never an error
//! - **Reliability**: owns every component with shared, constructor-injected state
//! - **GuardLayer**: the same guard as Tower middleware
//! - **Advisory policies**: rate limits and budgets inform callers, they never block
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use ai_reliability::{AiFeature, GuardRequest, Reliability, ReliabilityConfig};
//! use tower::BoxError;
//!
//! # async fn example() {
//! ai_reliability::observability::init_tracing();
//! let reliability = Reliability::new(ReliabilityConfig::default());
//!
//! let request = GuardRequest::new("extract_text")
//!     .user("user-1")
//!     .case("case-9")
//!     .concurrency_key("ocr");
//!
//! let result = reliability
//!     .guard_feature(AiFeature::Ocr, request, |ctx| async move {
//!         // long-running work should watch `ctx.cancel`
//!         let _ = ctx.attempt;
//!         Ok::<_, BoxError>("page text".to_string())
//!     })
//!     .await;
//!
//! match result.data {
//!     Some(text) => println!("{text}"),
//!     None => println!("{}", result.message.unwrap_or_default()),
//! }
//! # }
//! ```

pub mod alerts;
pub mod budget;
pub mod classify;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod features;
pub mod guard;
pub mod layer;
pub mod observability;
pub mod phase;
pub mod rate_limit;
pub mod redact;
pub mod retry;
pub mod service;

pub use alerts::{Alert, AlertHook, AlertManager, AlertSeverity, AlertStats, AlertType, SlackHook};
pub use budget::{BudgetStatus, BudgetTracker, OperationType};
pub use classify::{abort, classify_error, normalize_error, ClassifiedError, ErrorCode, NormalizedError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{Limiter, LimiterRegistry, LimiterStats};
pub use config::{ConfigBuilder, ReliabilityConfig};
pub use error::{GuardError, Result};
pub use features::{feature_disabled_response, AiFeature, FeatureFlags};
pub use guard::{
    AttemptContext, ExecutionGuard, FailureRecord, GuardProgress, GuardRequest, GuardResult,
    GuardStatus,
};
pub use layer::{GuardLayer, Guarded};
pub use phase::{MessageStyle, PhaseAdjustments, PhaseAwareness, UserPhase, WarningKind};
pub use rate_limit::{ActionGuard, RateLimitDecision, SoftRateLimiter};
pub use redact::redact_secrets;
pub use retry::{retry_async, Retry, RetryPolicy};
pub use service::{Reliability, ReliabilitySnapshot};

// Re-export Tower traits that users need
pub use tower::{BoxError, Layer, Service, ServiceExt};
