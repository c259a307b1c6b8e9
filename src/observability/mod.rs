//! Observability: tracing subscriber setup
//!
//! What this module provides
//! - `init_tracing()`: human-readable fmt subscriber
//! - `init_json_tracing()`: JSON lines for log shippers
//!
//! Implementation strategy
//! - Filter from `RUST_LOG`, falling back to `info`
//! - `try_init` so repeated calls (tests, embedding applications that already installed a
//!   subscriber) are no-ops
//!
//! The guard itself emits an `ai_guard` span per execution with `operation`, `user_id`,
//! `case_id` and `concurrency_key` fields; error text in events is already redacted.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a fmt subscriber. Returns false if a global subscriber was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber. Returns false if a global subscriber was already set.
pub fn init_json_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init_tracing();
        assert!(!init_tracing());
        assert!(!init_json_tracing());
        // some other test may have installed a subscriber first
        let _ = first;
    }
}
