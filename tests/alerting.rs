//! Monitor signals, alert hooks and Slack payloads.

use std::sync::Arc;
use std::time::Duration;

use ai_reliability::alerts::slack::slack_payload;
use ai_reliability::{
    Alert, AlertHook, AlertSeverity, AlertType, FeatureFlags, Reliability, ReliabilityConfig,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

struct Recorder(mpsc::UnboundedSender<Alert>);

#[async_trait]
impl AlertHook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_alert(&self, alert: &Alert) -> ai_reliability::Result<()> {
        let _ = self.0.send(alert.clone());
        Ok(())
    }
}

#[tokio::test]
async fn ocr_backlog_raises_one_alert_per_cooldown() {
    let r = Reliability::new(ReliabilityConfig::default())
        .with_feature_flags(FeatureFlags::with_env(|_| None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    r.alerts().register_hook(Arc::new(Recorder(tx)));

    let limiter = r.limiters().limiter("ocr", Some("u1"));
    let _a = limiter.acquire().await.unwrap();
    let _b = limiter.acquire().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        waiters.push(tokio::spawn(async move {
            let _permit = limiter.acquire().await;
        }));
    }
    while limiter.queued() < 20 {
        tokio::task::yield_now().await;
    }

    let raised = r.evaluate_signals();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].alert_type, AlertType::OcrBacklog);
    assert_eq!(raised[0].severity, AlertSeverity::Warning);

    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id, raised[0].id);

    // still backed up, but inside the cooldown
    assert!(r.evaluate_signals().is_empty());
    assert_eq!(r.alerts().alert_stats().total, 1);

    for w in &waiters {
        w.abort();
    }
}

#[tokio::test]
async fn acknowledged_alerts_leave_the_unacknowledged_view() {
    let r = Reliability::new(ReliabilityConfig::default());
    let a = r.alerts().alert_database_latency("load_case", 4_500);
    let b = r.alerts().alert_cost_anomaly("u7", 700, 500);
    assert_eq!(a.severity, AlertSeverity::Critical);
    assert_eq!(b.severity, AlertSeverity::Warning);

    r.alerts().acknowledge_alert(a.id);
    let open: Vec<_> = r
        .alerts()
        .unacknowledged_alerts()
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(open, vec![b.id]);
    assert_eq!(r.alerts().recent_alerts(10)[0].id, b.id);
}

#[test]
fn slack_payload_uses_attachments() {
    let r = Reliability::new(ReliabilityConfig::default());
    let alert = r
        .alerts()
        .alert_auth_error("ocr-provider", "Bearer abc.def.ghi was rejected");
    let payload = slack_payload(&alert);
    let attachment = &payload["attachments"][0];
    assert_eq!(attachment["color"], "danger");
    assert!(attachment["title"].as_str().unwrap().contains("ocr-provider"));
    assert!(!attachment["text"].as_str().unwrap().contains("abc.def.ghi"));
    assert_eq!(attachment["ts"], alert.timestamp.timestamp());
}
