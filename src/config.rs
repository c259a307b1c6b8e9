//! Configuration for the reliability layer
//!
//! Every policy constant (timeouts, retry curve, per-key concurrency, soft rate limits,
//! budget prices, phase thresholds, alert thresholds) lives here so it can be changed
//! through a TOML file, the environment, or the builder instead of code edits.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::phase::{MessageStyle, PhaseAdjustments};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Execution guard defaults
    pub guard: GuardConfig,

    /// Retry/backoff curve
    pub retry: RetryConfig,

    /// Per-key concurrency limits
    pub concurrency: ConcurrencyConfig,

    /// Soft rate limits per action
    pub rate_limits: RateLimitConfig,

    /// Daily cost budget policy
    pub budget: BudgetConfig,

    /// Lifecycle phase thresholds and tuning
    pub phase: PhaseConfig,

    /// Alert thresholds and delivery
    pub alerts: AlertConfig,
}

/// Execution guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Per-attempt deadline when the caller does not set one
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,

    /// Retries when the caller does not set them
    pub default_retries: usize,

    /// Failure ring buffer size
    pub failure_log_capacity: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            default_retries: 3,
            failure_log_capacity: 100,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: usize,

    /// Initial retry delay, also the floor of every computed delay
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Maximum retry delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Apply ±25% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Concurrency limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Limit for keys without an explicit entry
    pub default_limit: usize,

    /// Limit per concurrency key
    pub limits: BTreeMap<String, usize>,

    /// Upper bound on live limiter instances before idle ones are evicted
    pub max_limiters: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        let limits = [
            ("ocr", 2),
            ("document_analysis", 1),
            ("claim_suggestion", 2),
            ("pattern_analysis", 1),
            ("document_compilation", 1),
            ("chat", 3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            default_limit: 2,
            limits,
            max_limiters: 1024,
        }
    }
}

impl ConcurrencyConfig {
    pub fn limit_for(&self, key: &str) -> usize {
        self.limits
            .get(key)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }
}

/// Soft limit for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLimit {
    /// In-flight actions per user before `queued` is signalled
    pub max_concurrent: usize,

    /// Actions allowed per sliding window
    #[serde(default)]
    pub max_per_period: Option<usize>,

    /// Sliding window length
    #[serde(default, with = "option_duration_ms")]
    pub period: Option<Duration>,

    /// Minimum gap between two actions
    #[serde(default, with = "option_duration_ms")]
    pub cooldown: Option<Duration>,
}

impl ActionLimit {
    pub fn concurrent(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            max_per_period: None,
            period: None,
            cooldown: None,
        }
    }

    pub fn per_period(mut self, max: usize, period: Duration) -> Self {
        self.max_per_period = Some(max);
        self.period = Some(period);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }
}

/// Soft rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit for actions without an explicit entry
    pub default: ActionLimit,

    /// Limit per action name
    pub actions: BTreeMap<String, ActionLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut actions = BTreeMap::new();
        actions.insert(
            "ocr".to_string(),
            ActionLimit::concurrent(2).per_period(30, Duration::from_secs(3600)),
        );
        actions.insert(
            "document_analysis".to_string(),
            ActionLimit::concurrent(1).cooldown(Duration::from_secs(5)),
        );
        actions.insert(
            "claim_suggestion".to_string(),
            ActionLimit::concurrent(1).per_period(20, Duration::from_secs(3600)),
        );
        actions.insert(
            "pattern_analysis".to_string(),
            ActionLimit::concurrent(1)
                .per_period(10, Duration::from_secs(3600))
                .cooldown(Duration::from_secs(30)),
        );
        actions.insert(
            "document_compilation".to_string(),
            ActionLimit::concurrent(1).cooldown(Duration::from_secs(10)),
        );
        actions.insert(
            "chat".to_string(),
            ActionLimit::concurrent(2).per_period(30, Duration::from_secs(60)),
        );

        Self {
            default: ActionLimit::concurrent(3),
            actions,
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, action: &str) -> &ActionLimit {
        self.actions.get(action).unwrap_or(&self.default)
    }
}

/// Daily budget policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Advisory spend per user per UTC day
    pub daily_budget_cents: u64,

    /// Estimated cents per operation, keyed by operation name
    pub cost_cents: BTreeMap<String, u64>,

    /// Cost for operations missing from `cost_cents`
    pub default_cost_cents: u64,

    /// Days of history kept by `cleanup_old_records` callers
    pub retention_days: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let cost_cents = [
            ("ocr", 5),
            ("document_analysis", 10),
            ("claim_suggestion", 8),
            ("pattern_analysis", 15),
            ("document_compilation", 20),
            ("chat", 2),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            daily_budget_cents: 500,
            cost_cents,
            default_cost_cents: 5,
            retention_days: 30,
        }
    }
}

impl BudgetConfig {
    pub fn cost_for(&self, operation: &str) -> u64 {
        self.cost_cents
            .get(operation)
            .copied()
            .unwrap_or(self.default_cost_cents)
    }
}

/// Lifecycle phase thresholds and per-phase tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Accounts younger than this are in intake
    pub early_stage_days: i64,

    /// Users with fewer cases than this are in intake
    pub early_stage_cases: u32,

    /// Accounts at least this old are power users
    pub power_days: i64,

    /// Users with at least this many cases are power users
    pub power_cases: u32,

    pub intake: PhaseAdjustments,
    pub active: PhaseAdjustments,
    pub power: PhaseAdjustments,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            early_stage_days: 14,
            early_stage_cases: 3,
            power_days: 60,
            power_cases: 10,
            intake: PhaseAdjustments {
                ai_timeout: Duration::from_secs(120),
                max_retries: 5,
                queue_priority: 1,
                message_style: MessageStyle::Calm,
                show_warnings: false,
            },
            active: PhaseAdjustments {
                ai_timeout: Duration::from_secs(60),
                max_retries: 3,
                queue_priority: 2,
                message_style: MessageStyle::Standard,
                show_warnings: true,
            },
            power: PhaseAdjustments {
                ai_timeout: Duration::from_secs(45),
                max_retries: 2,
                queue_priority: 3,
                message_style: MessageStyle::Concise,
                show_warnings: true,
            },
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Alert ring buffer size
    pub capacity: usize,

    /// Failures inside `failure_window` that count as a spike
    pub failure_spike_threshold: usize,

    #[serde(with = "duration_ms")]
    pub failure_window: Duration,

    /// Queued OCR tasks that count as a backlog
    pub ocr_backlog_threshold: usize,

    /// Database round-trip considered slow
    pub db_latency_threshold_ms: u64,

    /// Minimum gap between two monitor alerts of the same type
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,

    /// Incoming webhook for warning/critical alerts
    pub slack_webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            failure_spike_threshold: 5,
            failure_window: Duration::from_secs(600),
            ocr_backlog_threshold: 20,
            db_latency_threshold_ms: 2000,
            cooldown: Duration::from_secs(900),
            slack_webhook_url: None,
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ReliabilityConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReliabilityConfig::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.guard.default_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.guard.default_retries = retries;
        self.config.retry.max_retries = retries;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn concurrency_limit(mut self, key: impl Into<String>, limit: usize) -> Self {
        self.config.concurrency.limits.insert(key.into(), limit);
        self
    }

    pub fn action_limit(mut self, action: impl Into<String>, limit: ActionLimit) -> Self {
        self.config.rate_limits.actions.insert(action.into(), limit);
        self
    }

    pub fn daily_budget_cents(mut self, cents: u64) -> Self {
        self.config.budget.daily_budget_cents = cents;
        self
    }

    pub fn operation_cost(mut self, operation: impl Into<String>, cents: u64) -> Self {
        self.config.budget.cost_cents.insert(operation.into(), cents);
        self
    }

    pub fn slack_webhook(mut self, url: impl Into<String>) -> Self {
        self.config.alerts.slack_webhook_url = Some(url.into());
        self
    }

    pub fn build(self) -> ReliabilityConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> ReliabilityConfig {
    apply_env(ReliabilityConfig::default(), |key| std::env::var(key).ok())
}

/// Overlay environment values onto `config` using the given lookup.
pub fn apply_env<F>(mut config: ReliabilityConfig, lookup: F) -> ReliabilityConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("SLACK_WEBHOOK_URL") {
        if !url.trim().is_empty() {
            config.alerts.slack_webhook_url = Some(url.trim().to_string());
        }
    }

    if let Some(ms) = lookup("AI_GUARD_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.guard.default_timeout = Duration::from_millis(ms);
    }

    if let Some(n) = lookup("AI_GUARD_MAX_RETRIES").and_then(|v| v.parse::<usize>().ok()) {
        config.guard.default_retries = n;
        config.retry.max_retries = n;
    }

    if let Some(cents) = lookup("AI_DAILY_BUDGET_CENTS").and_then(|v| v.parse::<u64>().ok()) {
        config.budget.daily_budget_cents = cents;
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ReliabilityConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

/// Parse configuration from a TOML document
pub fn from_toml_str(contents: &str) -> Result<ReliabilityConfig> {
    let config: ReliabilityConfig = toml::from_str(contents)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ReliabilityConfig) -> Result<()> {
    if config.retry.initial_delay > config.retry.max_delay {
        return Err(GuardError::Config(
            "retry.initial_delay must not exceed retry.max_delay".to_string(),
        ));
    }
    if config.retry.backoff_multiplier < 1.0 {
        return Err(GuardError::Config(
            "retry.backoff_multiplier must be >= 1.0".to_string(),
        ));
    }
    if config.alerts.capacity == 0 || config.guard.failure_log_capacity == 0 {
        return Err(GuardError::Config(
            "ring buffer capacities must be non-zero".to_string(),
        ));
    }
    Ok(())
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
