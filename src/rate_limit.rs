//! Soft, per-user rate limiting.
//!
//! Nothing here ever blocks a request: [`SoftRateLimiter::check_rate_limit`] always
//! answers `allowed: true` and only sets `queued` plus a friendly message when the user
//! is inside a cooldown, over a period quota, or at the concurrency ceiling for an action.
//! Call sites decide whether to surface the hint.
//!
//! In-flight accounting is RAII: [`SoftRateLimiter::record_action_start`] returns an
//! [`ActionGuard`] that releases its slot when dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Always true; the limiter is advisory
    pub allowed: bool,
    pub queued: bool,
    pub message: Option<String>,
    pub wait_ms: Option<u64>,
}

impl RateLimitDecision {
    fn clear() -> Self {
        Self {
            allowed: true,
            queued: false,
            message: None,
            wait_ms: None,
        }
    }

    fn queued(message: String, wait_ms: Option<u64>) -> Self {
        Self {
            allowed: true,
            queued: true,
            message: Some(message),
            wait_ms,
        }
    }
}

#[derive(Debug, Default)]
struct ActionRecord {
    started: VecDeque<DateTime<Utc>>,
    last_action: Option<DateTime<Utc>>,
    concurrent: usize,
    last_seen: Option<DateTime<Utc>>,
}

type RecordKey = (String, String);
type Records = Arc<Mutex<HashMap<RecordKey, ActionRecord>>>;

fn lock(records: &Records) -> MutexGuard<'_, HashMap<RecordKey, ActionRecord>> {
    records.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub tracked_records: usize,
    pub in_flight: usize,
}

pub struct SoftRateLimiter {
    config: RateLimitConfig,
    records: Records,
    clock: Arc<dyn Clock>,
}

impl SoftRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Advise whether `user_id` should wait before starting `action`.
    pub fn check_rate_limit(&self, user_id: &str, action: &str) -> RateLimitDecision {
        let limit = self.config.limit_for(action);
        let now = self.clock.now();
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&(user_id.to_string(), action.to_string())) else {
            return RateLimitDecision::clear();
        };

        if let (Some(cooldown), Some(last)) = (limit.cooldown, record.last_action) {
            let elapsed = (now - last).to_std().unwrap_or_default();
            if elapsed < cooldown {
                let wait = cooldown - elapsed;
                debug!(user_id, action, wait_ms = wait.as_millis() as u64, "action in cooldown");
                return RateLimitDecision::queued(
                    format!(
                        "Just a moment. You can run this again in {} seconds.",
                        wait.as_secs().max(1)
                    ),
                    Some(wait.as_millis() as u64),
                );
            }
        }

        if let (Some(max), Some(period)) = (limit.max_per_period, limit.period) {
            prune(&mut record.started, now, period);
            if record.started.len() >= max {
                let wait = record
                    .started
                    .front()
                    .map(|oldest| {
                        let elapsed = (now - *oldest).to_std().unwrap_or_default();
                        period.saturating_sub(elapsed)
                    })
                    .unwrap_or(period);
                debug!(user_id, action, max, "period quota reached");
                return RateLimitDecision::queued(
                    "You've used this a lot recently. Your request will run shortly.".to_string(),
                    Some(wait.as_millis() as u64),
                );
            }
        }

        if record.concurrent >= limit.max_concurrent {
            debug!(user_id, action, concurrent = record.concurrent, "concurrency ceiling reached");
            return RateLimitDecision::queued(
                "Your earlier request is still running. This one will start right after."
                    .to_string(),
                None,
            );
        }

        RateLimitDecision::clear()
    }

    /// Mark the start of `action` for `user_id`. The returned guard releases the
    /// concurrency slot when dropped.
    pub fn record_action_start(&self, user_id: &str, action: &str) -> ActionGuard {
        let now = self.clock.now();
        let key = (user_id.to_string(), action.to_string());
        {
            let mut records = lock(&self.records);
            let record = records.entry(key.clone()).or_default();
            // start history only feeds the period quota
            if let Some(period) = self.config.limit_for(action).period {
                record.started.push_back(now);
                prune(&mut record.started, now, period);
            }
            record.last_action = Some(now);
            record.last_seen = Some(now);
            record.concurrent += 1;
        }
        ActionGuard {
            records: self.records.clone(),
            clock: self.clock.clone(),
            key,
            released: false,
        }
    }

    /// Drop records with nothing in flight that have been idle longer than `max_idle`.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, r| {
            r.concurrent > 0
                || r.last_seen.map_or(false, |seen| {
                    (now - seen).to_std().unwrap_or_default() < max_idle
                })
        });
        before - records.len()
    }

    pub fn stats(&self) -> RateLimitStats {
        let records = lock(&self.records);
        RateLimitStats {
            tracked_records: records.len(),
            in_flight: records.values().map(|r| r.concurrent).sum(),
        }
    }

    pub fn reset(&self) {
        lock(&self.records).clear();
    }
}

fn prune(started: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, period: Duration) {
    while let Some(front) = started.front() {
        if (now - *front).to_std().unwrap_or_default() >= period {
            started.pop_front();
        } else {
            break;
        }
    }
}

/// In-flight marker for one action.
pub struct ActionGuard {
    records: Records,
    clock: Arc<dyn Clock>,
    key: RecordKey,
    released: bool,
}

impl ActionGuard {
    pub fn user_id(&self) -> &str {
        &self.key.0
    }

    pub fn action(&self) -> &str {
        &self.key.1
    }

    /// Release the slot now.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let now = self.clock.now();
        if let Some(record) = lock(&self.records).get_mut(&self.key) {
            record.concurrent = record.concurrent.saturating_sub(1);
            record.last_seen = Some(now);
        }
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ActionLimit;
    use chrono::TimeZone;

    fn limiter() -> (SoftRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
        ));
        (
            SoftRateLimiter::with_clock(RateLimitConfig::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn unseen_user_is_clear() {
        let (rl, _) = limiter();
        let d = rl.check_rate_limit("u1", "ocr");
        assert!(d.allowed);
        assert!(!d.queued);
    }

    #[test]
    fn concurrency_ceiling_queues_but_allows() {
        let (rl, _) = limiter();
        let _a = rl.record_action_start("u1", "ocr");
        assert!(!rl.check_rate_limit("u1", "ocr").queued);
        let b = rl.record_action_start("u1", "ocr");
        let d = rl.check_rate_limit("u1", "ocr");
        assert!(d.allowed);
        assert!(d.queued);
        drop(b);
        assert!(!rl.check_rate_limit("u1", "ocr").queued);
    }

    #[test]
    fn guard_releases_on_error_path() {
        fn failing(rl: &SoftRateLimiter) -> Result<(), &'static str> {
            let _guard = rl.record_action_start("u1", "chat");
            Err::<(), _>("upstream exploded")?;
            Ok(())
        }
        let (rl, _) = limiter();
        assert!(failing(&rl).is_err());
        assert_eq!(rl.stats().in_flight, 0);
    }

    #[test]
    fn cooldown_then_clear() {
        let (rl, clock) = limiter();
        rl.record_action_start("u1", "document_analysis").finish();
        let d = rl.check_rate_limit("u1", "document_analysis");
        assert!(d.queued);
        assert_eq!(d.wait_ms, Some(5_000));

        clock.advance(chrono::Duration::seconds(6));
        assert!(!rl.check_rate_limit("u1", "document_analysis").queued);
    }

    #[test]
    fn sliding_window_quota() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
        ));
        let mut config = RateLimitConfig::default();
        config.actions.insert(
            "export".to_string(),
            ActionLimit::concurrent(10).per_period(2, Duration::from_secs(60)),
        );
        let rl = SoftRateLimiter::with_clock(config, clock.clone());

        rl.record_action_start("u1", "export").finish();
        clock.advance(chrono::Duration::seconds(10));
        rl.record_action_start("u1", "export").finish();
        let d = rl.check_rate_limit("u1", "export");
        assert!(d.queued);
        assert_eq!(d.wait_ms, Some(50_000));

        clock.advance(chrono::Duration::seconds(51));
        assert!(!rl.check_rate_limit("u1", "export").queued);
    }

    #[test]
    fn unwindowed_actions_keep_no_start_history() {
        let (rl, clock) = limiter();
        for _ in 0..1_000 {
            rl.record_action_start("u1", "document_analysis").finish();
            clock.advance(chrono::Duration::hours(1));
            assert!(!rl.check_rate_limit("u1", "document_analysis").queued);
        }
        let records = lock(&rl.records);
        let record = &records[&("u1".to_string(), "document_analysis".to_string())];
        assert!(record.started.is_empty());
    }

    #[test]
    fn windowed_history_stays_within_period() {
        let (rl, clock) = limiter();
        for _ in 0..500 {
            rl.record_action_start("u1", "ocr").finish();
            clock.advance(chrono::Duration::minutes(10));
        }
        let records = lock(&rl.records);
        let record = &records[&("u1".to_string(), "ocr".to_string())];
        // one hour window, one start every ten minutes
        assert!(record.started.len() <= 6);
    }

    #[test]
    fn users_are_independent() {
        let (rl, _) = limiter();
        let _g = rl.record_action_start("u1", "claim_suggestion");
        assert!(rl.check_rate_limit("u1", "claim_suggestion").queued);
        assert!(!rl.check_rate_limit("u2", "claim_suggestion").queued);
    }

    #[test]
    fn cleanup_keeps_in_flight() {
        let (rl, clock) = limiter();
        rl.record_action_start("u1", "ocr").finish();
        let _busy = rl.record_action_start("u2", "ocr");
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(rl.cleanup(Duration::from_secs(3600)), 1);
        assert_eq!(rl.stats().tracked_records, 1);
        rl.reset();
        assert_eq!(rl.stats().tracked_records, 0);
    }
}
