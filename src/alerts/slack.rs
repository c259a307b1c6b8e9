//! Slack incoming-webhook hook.
//!
//! Posts `{ "attachments": [{ color, title, text, ts }] }` for warning and critical
//! alerts. Info alerts stay in the local log only.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{Alert, AlertHook, AlertSeverity};
use crate::error::{GuardError, Result};
use crate::redact::redact_secrets;

pub struct SlackHook {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackHook {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    /// Hook for `SLACK_WEBHOOK_URL`, if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(Self::new)
    }
}

fn color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "#439FE0",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "danger",
    }
}

/// Webhook body for `alert`.
pub fn slack_payload(alert: &Alert) -> Value {
    json!({
        "attachments": [{
            "color": color(alert.severity),
            "title": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.title),
            "text": alert.message,
            "ts": alert.timestamp.timestamp(),
        }]
    })
}

fn rejected(status: u16, body: &str) -> GuardError {
    GuardError::Hook {
        hook: "slack".to_string(),
        message: format!("Slack returned HTTP {status}: {}", redact_secrets(body)),
    }
}

#[async_trait]
impl AlertHook for SlackHook {
    fn name(&self) -> &str {
        "slack"
    }

    async fn on_alert(&self, alert: &Alert) -> Result<()> {
        if alert.severity == AlertSeverity::Info {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&slack_payload(alert))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(rejected(status, &body));
        }

        debug!(alert_id = %alert.id, "alert posted to slack");
        Ok(())
    }
}
