//! The reliability service: every component wired together with shared state.
//!
//! What this module provides
//! - `Reliability`: owns the guard, limiter registry, feature flags, soft rate limiter,
//!   budget tracker, phase awareness and alert manager for one process
//! - `ReliabilitySnapshot`: serializable read model for the admin dashboard
//! - A monitor (`evaluate_signals`) turning failure, backlog, auth and cost signals
//!   into alerts with a per-type cooldown
//!
//! Implementation strategy
//! - Constructor injection only; there are no process globals. Components that key on
//!   dates share the same `Clock`
//! - A Slack hook is registered at construction when `alerts.slack_webhook_url` is set
//!
//! Testing strategy
//! - `ManualClock` drives monitor cooldowns; failures are produced through the guard

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::BoxError;
use tracing::{debug, info};

use crate::alerts::{Alert, AlertManager, AlertStats, AlertType, SlackHook};
use crate::budget::{BudgetStats, BudgetTracker};
use crate::classify::ErrorCode;
use crate::clock::{Clock, SystemClock};
use crate::concurrency::{LimiterRegistry, LimiterStats};
use crate::config::ReliabilityConfig;
use crate::features::{feature_disabled_response, AiFeature, FeatureFlagState, FeatureFlags};
use crate::guard::{AttemptContext, ExecutionGuard, GuardRequest, GuardResult};
use crate::phase::PhaseAwareness;
use crate::rate_limit::{RateLimitStats, SoftRateLimiter};

/// Dashboard read model. Holds counts and identifiers only, never request content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilitySnapshot {
    pub generated_at: DateTime<Utc>,
    pub limiters: Vec<LimiterStats>,
    pub total_active: usize,
    pub total_queued: usize,
    pub rate_limits: RateLimitStats,
    pub budget: BudgetStats,
    pub alerts: AlertStats,
    /// Failures inside the alerting window
    pub recent_failures: usize,
    pub features: Vec<FeatureFlagState>,
}

pub struct Reliability {
    config: ReliabilityConfig,
    clock: Arc<dyn Clock>,
    limiters: Arc<LimiterRegistry>,
    guard: Arc<ExecutionGuard>,
    flags: FeatureFlags,
    rate_limiter: SoftRateLimiter,
    budget: BudgetTracker,
    phases: PhaseAwareness,
    alerts: AlertManager,
    last_alerted: Mutex<HashMap<AlertType, DateTime<Utc>>>,
}

impl Reliability {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ReliabilityConfig, clock: Arc<dyn Clock>) -> Self {
        let limiters = Arc::new(LimiterRegistry::new(config.concurrency.clone()));
        let guard = Arc::new(ExecutionGuard::with_parts(
            config.guard.clone(),
            config.retry.clone(),
            limiters.clone(),
            clock.clone(),
        ));
        let alerts = AlertManager::with_clock(config.alerts.clone(), clock.clone());
        if let Some(url) = config.alerts.slack_webhook_url.as_deref() {
            if !url.trim().is_empty() {
                alerts.register_hook(Arc::new(SlackHook::new(url)));
            }
        }

        Self {
            flags: FeatureFlags::new(),
            rate_limiter: SoftRateLimiter::with_clock(config.rate_limits.clone(), clock.clone()),
            budget: BudgetTracker::with_clock(config.budget.clone(), clock.clone()),
            phases: PhaseAwareness::with_clock(config.phase.clone(), clock.clone()),
            alerts,
            limiters,
            guard,
            clock,
            config,
            last_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the feature flag source (e.g. to inject a test environment).
    pub fn with_feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn rate_limiter(&self) -> &SoftRateLimiter {
        &self.rate_limiter
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn phases(&self) -> &PhaseAwareness {
        &self.phases
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    /// Run `operation` through the guard unless `feature` is switched off.
    pub async fn guard_feature<F, Fut, T>(
        &self,
        feature: AiFeature,
        request: GuardRequest,
        operation: F,
    ) -> GuardResult<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        if !self.flags.is_enabled(feature.as_str()) {
            debug!(feature = %feature, operation = %request.name, "feature disabled; skipping");
            return feature_disabled_response(feature.as_str());
        }
        self.guard.execute(request, operation).await
    }

    pub fn snapshot(&self) -> ReliabilitySnapshot {
        ReliabilitySnapshot {
            generated_at: self.clock.now(),
            limiters: self.limiters.stats(),
            total_active: self.limiters.total_active(),
            total_queued: self.limiters.total_queued(None),
            rate_limits: self.rate_limiter.stats(),
            budget: self.budget.stats(),
            alerts: self.alerts.alert_stats(),
            recent_failures: self
                .guard
                .failure_count_since(self.config.alerts.failure_window),
            features: self.flags.states(),
        }
    }

    fn last_alerted(&self) -> MutexGuard<'_, HashMap<AlertType, DateTime<Utc>>> {
        self.last_alerted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True (and the cooldown restarts) when no alert of `alert_type` was raised by the
    /// monitor within the cooldown.
    fn take_cooldown(&self, alert_type: AlertType) -> bool {
        let now = self.clock.now();
        let cooldown = chrono::Duration::from_std(self.config.alerts.cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut last = self.last_alerted();
        if last.get(&alert_type).map_or(false, |at| now - *at < cooldown) {
            debug!(alert_type = %alert_type, "alert suppressed by cooldown");
            return false;
        }
        last.insert(alert_type, now);
        true
    }

    /// Check failure, backlog, auth and budget signals and raise alerts for those past
    /// their thresholds. Returns the alerts raised by this pass.
    pub fn evaluate_signals(&self) -> Vec<Alert> {
        let cfg = &self.config.alerts;
        let mut raised = Vec::new();
        let failures = self.guard.failures_since(cfg.failure_window);

        if failures.len() >= cfg.failure_spike_threshold
            && self.take_cooldown(AlertType::AiFailureSpike)
        {
            let mut by_operation: HashMap<&str, usize> = HashMap::new();
            for f in &failures {
                *by_operation.entry(f.operation.as_str()).or_insert(0) += 1;
            }
            let operation = by_operation
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(op, _)| op)
                .unwrap_or("unknown");
            raised.push(self.alerts.alert_ai_failure_spike(
                operation,
                failures.len(),
                cfg.failure_window,
            ));
        }

        let ocr_queued = self.limiters.total_queued(Some(AiFeature::Ocr.as_str()));
        if ocr_queued >= cfg.ocr_backlog_threshold && self.take_cooldown(AlertType::OcrBacklog) {
            raised.push(self.alerts.alert_ocr_backlog(ocr_queued));
        }

        if let Some(auth) = failures
            .iter()
            .rev()
            .find(|f| f.error_code == ErrorCode::AuthError)
        {
            if self.take_cooldown(AlertType::AuthError) {
                raised.push(self.alerts.alert_auth_error(&auth.operation, &auth.message));
            }
        }

        if let Some((user_id, cost)) = self.budget.over_budget_users().into_iter().next() {
            if self.take_cooldown(AlertType::CostAnomaly) {
                raised.push(self.alerts.alert_cost_anomaly(
                    &user_id,
                    cost,
                    self.config.budget.daily_budget_cents,
                ));
            }
        }

        if !raised.is_empty() {
            info!(count = raised.len(), "monitor raised alerts");
        }
        raised
    }

    /// Alert when a database round-trip exceeds the configured threshold.
    pub fn record_database_latency(&self, operation: &str, latency_ms: u64) -> Option<Alert> {
        if latency_ms < self.config.alerts.db_latency_threshold_ms
            || !self.take_cooldown(AlertType::DatabaseLatency)
        {
            return None;
        }
        Some(self.alerts.alert_database_latency(operation, latency_ms))
    }

    /// Clear all in-memory reliability state. Limiters with work in flight survive.
    pub fn reset(&self) {
        let limiters = self.limiters.reset();
        self.guard.clear_failures();
        self.rate_limiter.reset();
        self.budget.reset();
        self.alerts.clear();
        self.flags.clear_all_overrides();
        self.last_alerted().clear();
        info!(limiters_dropped = limiters, "reliability state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::OperationType;
    use crate::clock::ManualClock;
    use crate::guard::GuardStatus;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn service() -> (Reliability, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 4, 2, 15, 0, 0).unwrap(),
        ));
        let r = Reliability::with_clock(ReliabilityConfig::default(), clock.clone())
            .with_feature_flags(FeatureFlags::with_env(|_| None));
        (r, clock)
    }

    async fn fail(r: &Reliability, op: &str, msg: &'static str) {
        let res: GuardResult<()> = r
            .guard()
            .execute(GuardRequest::new(op).retries(0), move |_| async move {
                Err(msg.into())
            })
            .await;
        assert_ne!(res.status, GuardStatus::Success);
    }

    #[tokio::test]
    async fn disabled_feature_short_circuits() {
        let vars: HashMap<String, String> =
            [("AI_FEATURE_CHAT".to_string(), "false".to_string())].into();
        let r = Reliability::new(ReliabilityConfig::default())
            .with_feature_flags(FeatureFlags::with_env(move |k| vars.get(k).cloned()));

        let res: GuardResult<()> = r
            .guard_feature(AiFeature::Chat, GuardRequest::new("chat"), |_| async {
                Err::<(), BoxError>("must not run".into())
            })
            .await;
        assert_eq!(res.status, GuardStatus::Disabled);

        let res = r
            .guard_feature(AiFeature::Ocr, GuardRequest::new("ocr"), |_| async {
                Ok::<_, BoxError>(1)
            })
            .await;
        assert_eq!(res.data, Some(1));
    }

    #[tokio::test]
    async fn failure_spike_alert_respects_cooldown() {
        let (r, clock) = service();
        for _ in 0..5 {
            fail(&r, "pattern_analysis", "model exploded").await;
        }
        let raised = r.evaluate_signals();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].alert_type, AlertType::AiFailureSpike);
        assert!(raised[0].title.contains("pattern_analysis"));

        assert!(r.evaluate_signals().is_empty());

        clock.advance(chrono::Duration::minutes(16));
        // failures are now outside the 10 minute window
        assert!(r.evaluate_signals().is_empty());
        for _ in 0..5 {
            fail(&r, "ocr", "model exploded").await;
        }
        assert_eq!(r.evaluate_signals().len(), 1);
    }

    #[tokio::test]
    async fn auth_and_cost_signals() {
        let (r, _) = service();
        fail(&r, "claim_suggestion", "401 Unauthorized").await;
        r.budget()
            .record_ai_usage("u9", OperationType::DocumentCompilation, 30);

        let raised = r.evaluate_signals();
        let types: Vec<_> = raised.iter().map(|a| a.alert_type.clone()).collect();
        assert_eq!(types, vec![AlertType::AuthError, AlertType::CostAnomaly]);
    }

    #[tokio::test]
    async fn snapshot_and_reset() {
        let (r, _) = service();
        fail(&r, "chat", "boom").await;
        r.budget().record_ai_usage("u1", OperationType::Chat, 3);
        let _g = r.rate_limiter().record_action_start("u1", "chat");
        r.flags().set_enabled("ocr", false);

        let snap = r.snapshot();
        assert_eq!(snap.recent_failures, 1);
        assert_eq!(snap.budget.total_cost_cents_today, 6);
        assert_eq!(snap.rate_limits.in_flight, 1);
        assert!(snap.features.iter().any(|f| f.feature == "ocr" && !f.enabled));
        assert!(serde_json::to_string(&snap).is_ok());

        r.reset();
        let snap = r.snapshot();
        assert_eq!(snap.recent_failures, 0);
        assert_eq!(snap.budget.users_today, 0);
        assert!(snap.limiters.is_empty());
        assert!(snap.features.iter().all(|f| f.enabled));
    }

    #[test]
    fn database_latency_threshold() {
        let (r, _) = service();
        assert!(r.record_database_latency("list_cases", 150).is_none());
        assert!(r.record_database_latency("list_cases", 2500).is_some());
        assert!(r.record_database_latency("list_cases", 2600).is_none());
    }
}
