//! Error types for the reliability layer

use thiserror::Error;

/// Result type alias for the reliability layer
pub type Result<T> = std::result::Result<T, GuardError>;

/// Main error type for the reliability layer.
///
/// Wrapped operations fail with `tower::BoxError`; this enum covers the layer's own
/// fallible surfaces (configuration, hooks, the limiter) and the timeout marker the
/// guard injects into the retry loop.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The guard's deadline fired before the operation settled
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A concurrency limiter was closed while a task waited for a slot
    #[error("concurrency limiter '{key}' is closed")]
    LimiterClosed { key: String },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Alert hook delivery failed
    #[error("Alert hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// HTTP error from an outbound webhook
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::Timeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "operation timed out after 1500ms");

        let err = GuardError::Hook {
            hook: "slack".to_string(),
            message: "HTTP 500".to_string(),
        };
        assert_eq!(err.to_string(), "Alert hook 'slack' failed: HTTP 500");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GuardError = io_err.into();
        assert!(matches!(err, GuardError::IoError(_)));
    }

    #[test]
    fn test_timeout_is_boxable() {
        let boxed: tower::BoxError = Box::new(GuardError::Timeout { timeout_ms: 10 });
        assert!(matches!(
            boxed.downcast_ref::<GuardError>(),
            Some(GuardError::Timeout { timeout_ms: 10 })
        ));
    }
}
