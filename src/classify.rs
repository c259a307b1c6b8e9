//! Error normalization and classification.
//!
//! Raw operation errors arrive as `tower::BoxError`. They are normalized into a
//! [`NormalizedError`] (message, code, detail chain), redacted, then classified into the
//! failure taxonomy the guard reports to callers:
//!
//! | Code | Retryable | Meaning |
//! |---|---|---|
//! | `AUTH_ERROR` | no | credential or configuration problem |
//! | `RATE_LIMIT` | yes | upstream throttling |
//! | `TIMEOUT` | yes | the guard deadline fired |
//! | `NETWORK_ERROR` | yes | connectivity |
//! | `ABORTED` | no | the operation asked not to be retried |
//! | anything else | yes | residual normalized code |

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use tower::BoxError;

use crate::error::GuardError;
use crate::redact::redact_secrets;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthError,
    RateLimit,
    Timeout,
    NetworkError,
    Aborted,
    InvalidInput,
    ServiceUnavailable,
    IoError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether a failure with this code is worth retrying by default.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCode::AuthError | ErrorCode::Aborted)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error tagged with an explicit code by the call site.
#[derive(Debug, Clone)]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for CodedError {}

/// Explicit non-retryable signal. The retry executor stops as soon as it sees one.
#[derive(Debug, Clone)]
pub struct AbortError {
    pub message: String,
}

impl AbortError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aborted: {}", self.message)
    }
}

impl StdError for AbortError {}

/// Box an [`AbortError`] for returning from a guarded operation.
pub fn abort(message: impl Into<String>) -> BoxError {
    Box::new(AbortError::new(message))
}

pub fn is_abort(err: &BoxError) -> bool {
    err.is::<AbortError>()
}

/// An error reduced to loggable, redacted parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub message: String,
    pub code: ErrorCode,
    /// Redacted source chain, outermost cause first
    pub detail: Option<String>,
}

/// Reduce an arbitrary error to message, code and redacted detail.
pub fn normalize_error(err: &(dyn StdError + 'static)) -> NormalizedError {
    let message = redact_secrets(&err.to_string());
    let code = intrinsic_code(err);

    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(redact_secrets(&cause.to_string()));
        source = cause.source();
    }
    let detail = if chain.is_empty() {
        None
    } else {
        Some(chain.join(" <- "))
    };

    NormalizedError {
        message,
        code,
        detail,
    }
}

fn intrinsic_code(err: &(dyn StdError + 'static)) -> ErrorCode {
    if let Some(coded) = err.downcast_ref::<CodedError>() {
        return coded.code;
    }
    if err.is::<AbortError>() {
        return ErrorCode::Aborted;
    }
    if let Some(GuardError::Timeout { .. }) = err.downcast_ref::<GuardError>() {
        return ErrorCode::Timeout;
    }
    if err.is::<tokio::time::error::Elapsed>() {
        return ErrorCode::Timeout;
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind;
        return match io.kind() {
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => ErrorCode::NetworkError,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorCode::InvalidInput,
            _ => ErrorCode::IoError,
        };
    }
    ErrorCode::UnknownError
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub retryable: bool,
    /// Human-readable, redacted message suitable for clients
    pub message: String,
    pub normalized: NormalizedError,
}

const AUTH_PATTERNS: &[&str] = &[
    "401",
    "403",
    "invalid_api_key",
    "invalid api key",
    "incorrect api key",
    "unauthorized",
    "authentication",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "rate_limit", "quota", "too many requests"];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "econnrefused",
    "econnreset",
    "enotfound",
    "connection refused",
    "connection reset",
    "socket hang up",
];

/// Numeric patterns (status codes) only match as whole tokens so that e.g. a
/// `timed out after 4010ms` message is not mistaken for a 401.
fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| {
        if p.bytes().all(|b| b.is_ascii_digit()) {
            haystack
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == *p)
        } else {
            haystack.contains(p)
        }
    })
}

/// Classify an error according to the priority order auth, rate limit, timeout,
/// network, then the normalized code.
pub fn classify_error(err: &(dyn StdError + 'static)) -> ClassifiedError {
    classify_normalized(normalize_error(err))
}

pub fn classify_normalized(normalized: NormalizedError) -> ClassifiedError {
    let text = normalized.message.to_lowercase();

    let code = if matches_any(&text, AUTH_PATTERNS) {
        ErrorCode::AuthError
    } else if matches_any(&text, RATE_LIMIT_PATTERNS) {
        ErrorCode::RateLimit
    } else if normalized.code == ErrorCode::Timeout || matches_any(&text, TIMEOUT_PATTERNS) {
        ErrorCode::Timeout
    } else if matches_any(&text, NETWORK_PATTERNS) {
        ErrorCode::NetworkError
    } else {
        normalized.code
    };

    let normalized = NormalizedError { code, ..normalized };
    ClassifiedError {
        code,
        retryable: code.is_retryable(),
        message: format_error_for_client(&normalized),
        normalized,
    }
}

/// Default retry predicate: never retry auth failures or aborts.
pub fn default_should_retry(err: &BoxError) -> bool {
    classify_error(err.as_ref()).retryable
}

/// Map a normalized error to the phrase shown to users.
pub fn format_error_for_client(err: &NormalizedError) -> String {
    match client_phrase(err.code) {
        Some(phrase) => phrase.to_string(),
        None => redact_secrets(&err.message),
    }
}

fn client_phrase(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::AuthError => {
            Some("The AI service is not configured correctly. Our team has been notified.")
        }
        ErrorCode::RateLimit => {
            Some("The AI service is busy right now. Please try again in a moment.")
        }
        ErrorCode::Timeout => Some("This is taking longer than expected. Please try again."),
        ErrorCode::NetworkError => {
            Some("We could not reach the AI service. Please check your connection and try again.")
        }
        ErrorCode::Aborted => Some("The request was cancelled."),
        ErrorCode::ServiceUnavailable => {
            Some("The AI service is temporarily unavailable. Please try again shortly.")
        }
        ErrorCode::InvalidInput => Some("The document or request could not be processed as submitted."),
        ErrorCode::IoError | ErrorCode::UnknownError => None,
    }
}
