//! Operational alerting
//!
//! What this module provides
//! - `AlertManager`: capped in-memory alert log with acknowledgement
//! - `AlertHook`: async delivery seam (Slack, paging, tests)
//! - Threshold-aware constructors for the signals the monitor watches
//!
//! Implementation strategy
//! - The log is a `VecDeque` ring buffer; the oldest alert is dropped once `capacity`
//!   is reached
//! - Hooks run on spawned tasks and are never awaited by `create_alert`; their errors
//!   are logged and swallowed
//! - Titles and messages pass through secret redaction before storage
//!
//! Testing strategy
//! - Ring buffer eviction order, severity escalation at twice the threshold
//! - A channel-backed hook observes fan-out

pub mod slack;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::AlertConfig;
use crate::error::Result;
use crate::redact::redact_secrets;

pub use slack::SlackHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    AiFailureSpike,
    OcrBacklog,
    AuthError,
    DatabaseLatency,
    CostAnomaly,
    Custom(String),
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertType::AiFailureSpike => f.write_str("ai_failure_spike"),
            AlertType::OcrBacklog => f.write_str("ocr_backlog"),
            AlertType::AuthError => f.write_str("auth_error"),
            AlertType::DatabaseLatency => f.write_str("database_latency"),
            AlertType::CostAnomaly => f.write_str("cost_anomaly"),
            AlertType::Custom(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub acknowledged: bool,
}

/// Delivery target for alerts.
#[async_trait]
pub trait AlertHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_alert(&self, alert: &Alert) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub unacknowledged: usize,
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
}

pub struct AlertManager {
    config: AlertConfig,
    alerts: Mutex<VecDeque<Alert>>,
    hooks: RwLock<Vec<Arc<dyn AlertHook>>>,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AlertConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            alerts: Mutex::new(VecDeque::new()),
            hooks: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    fn alerts(&self) -> MutexGuard<'_, VecDeque<Alert>> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_hook(&self, hook: Arc<dyn AlertHook>) {
        debug!(hook = hook.name(), "registered alert hook");
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn clear_hooks(&self) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Record an alert and fan it out to every hook.
    ///
    /// Hooks run on tasks spawned onto the current tokio runtime. Called outside a
    /// runtime the alert is still recorded and logged, but no hook is invoked.
    pub fn create_alert(
        &self,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: impl AsRef<str>,
        message: impl AsRef<str>,
        data: Value,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            severity,
            alert_type,
            title: redact_secrets(title.as_ref()),
            message: redact_secrets(message.as_ref()),
            data,
            acknowledged: false,
        };

        match severity {
            AlertSeverity::Info => info!(alert_type = %alert.alert_type, title = %alert.title, "{}", alert.message),
            AlertSeverity::Warning => warn!(alert_type = %alert.alert_type, title = %alert.title, "{}", alert.message),
            AlertSeverity::Critical => error!(alert_type = %alert.alert_type, title = %alert.title, "{}", alert.message),
        }

        {
            let capacity = self.config.capacity.max(1);
            let mut alerts = self.alerts();
            while alerts.len() >= capacity {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }

        self.dispatch(&alert);
        alert
    }

    fn dispatch(&self, alert: &Alert) {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if hooks.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                hooks = hooks.len(),
                alert_id = %alert.id,
                "create_alert called outside a tokio runtime; alert hooks skipped"
            );
            return;
        };
        for hook in hooks {
            let alert = alert.clone();
            handle.spawn(async move {
                if let Err(e) = hook.on_alert(&alert).await {
                    warn!(hook = hook.name(), alert_id = %alert.id, error = %e, "alert hook failed");
                }
            });
        }
    }

    fn escalate(value: u64, threshold: u64) -> AlertSeverity {
        if value >= threshold.saturating_mul(2) {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }

    pub fn alert_ai_failure_spike(&self, operation: &str, failures: usize, window: Duration) -> Alert {
        let severity = Self::escalate(failures as u64, self.config.failure_spike_threshold as u64);
        self.create_alert(
            severity,
            AlertType::AiFailureSpike,
            format!("AI failure spike: {operation}"),
            format!(
                "{failures} failures in the last {} minutes",
                window.as_secs() / 60
            ),
            json!({ "operation": operation, "failures": failures, "window_ms": window.as_millis() as u64 }),
        )
    }

    pub fn alert_ocr_backlog(&self, queue_depth: usize) -> Alert {
        let severity = Self::escalate(queue_depth as u64, self.config.ocr_backlog_threshold as u64);
        self.create_alert(
            severity,
            AlertType::OcrBacklog,
            "OCR backlog",
            format!("{queue_depth} documents waiting for text extraction"),
            json!({ "queue_depth": queue_depth }),
        )
    }

    pub fn alert_auth_error(&self, service: &str, message: &str) -> Alert {
        self.create_alert(
            AlertSeverity::Critical,
            AlertType::AuthError,
            format!("Authentication failure: {service}"),
            message,
            json!({ "service": service }),
        )
    }

    pub fn alert_database_latency(&self, operation: &str, latency_ms: u64) -> Alert {
        let severity = Self::escalate(latency_ms, self.config.db_latency_threshold_ms);
        self.create_alert(
            severity,
            AlertType::DatabaseLatency,
            format!("Slow database: {operation}"),
            format!("{operation} took {latency_ms}ms"),
            json!({ "operation": operation, "latency_ms": latency_ms }),
        )
    }

    pub fn alert_cost_anomaly(&self, user_id: &str, cost_cents: u64, limit_cents: u64) -> Alert {
        let severity = Self::escalate(cost_cents, limit_cents);
        self.create_alert(
            severity,
            AlertType::CostAnomaly,
            "AI cost anomaly",
            format!("user {user_id} spent {cost_cents}c today (limit {limit_cents}c)"),
            json!({ "user_id": user_id, "cost_cents": cost_cents, "limit_cents": limit_cents }),
        )
    }

    /// Newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts().iter().rev().take(limit).cloned().collect()
    }

    pub fn unacknowledged_alerts(&self) -> Vec<Alert> {
        self.alerts()
            .iter()
            .rev()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Returns false when no alert with `id` is retained.
    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        match self.alerts().iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alerts()
            .iter()
            .fold(AlertStats::default(), |mut stats, a| {
                stats.total += 1;
                if !a.acknowledged {
                    stats.unacknowledged += 1;
                }
                match a.severity {
                    AlertSeverity::Info => stats.info += 1,
                    AlertSeverity::Warning => stats.warning += 1,
                    AlertSeverity::Critical => stats.critical += 1,
                }
                stats
            })
    }

    pub fn len(&self) -> usize {
        self.alerts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.alerts().clear();
    }
}
