//! Per-user daily AI cost tracking
//!
//! What this module provides
//! - `BudgetTracker`: accumulates operation counts and estimated cost per `(user, UTC date)`
//! - `BudgetStatus`: used vs. limit for today
//!
//! Implementation strategy
//! - Costs come from the configurable cents-per-operation table in `BudgetConfig`
//! - Records are keyed by the `YYYY-MM-DD` date string from the injected clock, so
//!   usage for a new day never touches yesterday's record
//! - Advisory only: nothing here prevents an operation from running. The first time a
//!   user crosses the daily budget a warning is logged
//!
//! Testing strategy
//! - `ManualClock` drives day rollover and retention cutoffs deterministically

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{date_key, Clock, SystemClock};
use crate::config::BudgetConfig;

/// Billable AI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Ocr,
    DocumentAnalysis,
    ClaimSuggestion,
    PatternAnalysis,
    DocumentCompilation,
    Chat,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Ocr => "ocr",
            OperationType::DocumentAnalysis => "document_analysis",
            OperationType::ClaimSuggestion => "claim_suggestion",
            OperationType::PatternAnalysis => "pattern_analysis",
            OperationType::DocumentCompilation => "document_compilation",
            OperationType::Chat => "chat",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage of one user on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub user_id: String,
    pub date: String,
    pub operations: BTreeMap<String, u64>,
    pub estimated_cost_cents: u64,
    #[serde(skip)]
    warned: bool,
}

impl BudgetRecord {
    fn new(user_id: &str, date: String) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            operations: BTreeMap::new(),
            estimated_cost_cents: 0,
            warned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub used_cents: u64,
    pub limit_cents: u64,
    pub percent_used: f64,
    pub over_budget: bool,
}

impl BudgetStatus {
    fn new(used_cents: u64, limit_cents: u64) -> Self {
        let percent_used = if limit_cents == 0 {
            if used_cents > 0 {
                100.0
            } else {
                0.0
            }
        } else {
            used_cents as f64 * 100.0 / limit_cents as f64
        };
        Self {
            used_cents,
            limit_cents,
            percent_used,
            over_budget: used_cents > limit_cents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStats {
    pub users_today: usize,
    pub total_cost_cents_today: u64,
    pub over_budget_users: usize,
}

type Records = HashMap<(String, String), BudgetRecord>;

pub struct BudgetTracker {
    config: BudgetConfig,
    records: Mutex<Records>,
    clock: Arc<dyn Clock>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn today(&self) -> String {
        date_key(self.clock.today())
    }

    /// Record `count` operations of `operation` for `user_id` today.
    pub fn record_ai_usage(
        &self,
        user_id: &str,
        operation: OperationType,
        count: u64,
    ) -> BudgetStatus {
        self.record_usage(user_id, operation.as_str(), count)
    }

    /// Same as [`record_ai_usage`](Self::record_ai_usage) for operations outside
    /// [`OperationType`]; they are priced at `default_cost_cents`.
    pub fn record_usage(&self, user_id: &str, operation: &str, count: u64) -> BudgetStatus {
        let date = self.today();
        let cost = self.config.cost_for(operation).saturating_mul(count);
        let limit = self.config.daily_budget_cents;

        let mut records = self.records();
        let record = records
            .entry((user_id.to_string(), date.clone()))
            .or_insert_with(|| BudgetRecord::new(user_id, date));
        *record.operations.entry(operation.to_string()).or_insert(0) += count;
        record.estimated_cost_cents = record.estimated_cost_cents.saturating_add(cost);

        let status = BudgetStatus::new(record.estimated_cost_cents, limit);
        if status.over_budget && !record.warned {
            record.warned = true;
            warn!(
                user_id,
                used_cents = status.used_cents,
                limit_cents = limit,
                "user exceeded daily AI budget"
            );
        } else {
            debug!(user_id, operation, cost_cents = cost, "recorded AI usage");
        }
        status
    }

    pub fn user_budget_status(&self, user_id: &str) -> BudgetStatus {
        let used = self
            .records()
            .get(&(user_id.to_string(), self.today()))
            .map_or(0, |r| r.estimated_cost_cents);
        BudgetStatus::new(used, self.config.daily_budget_cents)
    }

    /// Today's record for `user_id`, if any usage was recorded.
    pub fn user_record(&self, user_id: &str) -> Option<BudgetRecord> {
        self.records()
            .get(&(user_id.to_string(), self.today()))
            .cloned()
    }

    /// Evict records dated before `today - days_to_keep`.
    pub fn cleanup_old_records(&self, days_to_keep: u32) -> usize {
        let Some(oldest_kept) = self
            .clock
            .today()
            .checked_sub_days(chrono::Days::new(days_to_keep.into()))
        else {
            return 0;
        };
        let cutoff = date_key(oldest_kept);
        let mut records = self.records();
        let before = records.len();
        // ISO dates order lexicographically
        records.retain(|(_, date), _| date.as_str() >= cutoff.as_str());
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, cutoff = %cutoff, "evicted old budget records");
        }
        removed
    }

    /// Users over budget today with their spend, highest first.
    pub fn over_budget_users(&self) -> Vec<(String, u64)> {
        let today = self.today();
        let limit = self.config.daily_budget_cents;
        let mut users: Vec<(String, u64)> = self
            .records()
            .values()
            .filter(|r| r.date == today && r.estimated_cost_cents > limit)
            .map(|r| (r.user_id.clone(), r.estimated_cost_cents))
            .collect();
        users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        users
    }

    pub fn stats(&self) -> BudgetStats {
        let today = self.today();
        let limit = self.config.daily_budget_cents;
        let records = self.records();
        let todays = records.values().filter(|r| r.date == today);
        let mut stats = BudgetStats {
            users_today: 0,
            total_cost_cents_today: 0,
            over_budget_users: 0,
        };
        for r in todays {
            stats.users_today += 1;
            stats.total_cost_cents_today += r.estimated_cost_cents;
            if r.estimated_cost_cents > limit {
                stats.over_budget_users += 1;
            }
        }
        stats
    }

    pub fn record_count(&self) -> usize {
        self.records().len()
    }

    pub fn reset(&self) {
        self.records().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn tracker() -> (BudgetTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 10, 8, 0, 0).unwrap(),
        ));
        (
            BudgetTracker::with_clock(BudgetConfig::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn over_budget_only_past_limit() {
        let (t, _) = tracker();
        // 25 compilations at 20c = exactly 500c
        let status = t.record_ai_usage("u1", OperationType::DocumentCompilation, 25);
        assert_eq!(status.used_cents, 500);
        assert!(!status.over_budget);
        assert!((status.percent_used - 100.0).abs() < f64::EPSILON);

        let status = t.record_ai_usage("u1", OperationType::Chat, 1);
        assert_eq!(status.used_cents, 502);
        assert!(status.over_budget);
        assert_eq!(t.over_budget_users(), vec![("u1".to_string(), 502)]);
    }

    #[test]
    fn operation_counts_accumulate() {
        let (t, _) = tracker();
        t.record_ai_usage("u1", OperationType::Ocr, 3);
        t.record_ai_usage("u1", OperationType::Ocr, 2);
        t.record_usage("u1", "transcription", 1);
        let record = t.user_record("u1").unwrap();
        assert_eq!(record.operations["ocr"], 5);
        assert_eq!(record.estimated_cost_cents, 5 * 5 + 5);
        assert_eq!(record.date, "2025-06-10");
    }

    #[test]
    fn new_day_starts_fresh_and_leaves_history() {
        let (t, clock) = tracker();
        t.record_ai_usage("u1", OperationType::PatternAnalysis, 2);
        clock.advance(chrono::Duration::days(1));

        assert_eq!(t.user_budget_status("u1").used_cents, 0);
        t.record_ai_usage("u1", OperationType::Chat, 1);
        assert_eq!(t.user_budget_status("u1").used_cents, 2);

        let records = t.records();
        let yesterday = &records[&("u1".to_string(), "2025-06-10".to_string())];
        assert_eq!(yesterday.estimated_cost_cents, 30);
    }

    #[test]
    fn cleanup_uses_date_cutoff() {
        let (t, clock) = tracker();
        t.record_ai_usage("u1", OperationType::Ocr, 1);
        clock.advance(chrono::Duration::days(10));
        t.record_ai_usage("u1", OperationType::Ocr, 1);

        assert_eq!(t.cleanup_old_records(10), 0);
        assert_eq!(t.cleanup_old_records(9), 1);
        assert_eq!(t.record_count(), 1);
    }

    #[test]
    fn unbounded_retention_evicts_nothing() {
        let (t, clock) = tracker();
        t.record_ai_usage("u1", OperationType::Ocr, 1);
        clock.advance(chrono::Duration::days(400));
        t.record_ai_usage("u1", OperationType::Ocr, 1);
        assert_eq!(t.cleanup_old_records(u32::MAX), 0);
        assert_eq!(t.record_count(), 2);
    }

    #[test]
    fn stats_cover_today_only() {
        let (t, clock) = tracker();
        t.record_ai_usage("u1", OperationType::Ocr, 1);
        clock.advance(chrono::Duration::days(1));
        t.record_ai_usage("u2", OperationType::Chat, 300);
        t.record_ai_usage("u3", OperationType::Chat, 1);
        let stats = t.stats();
        assert_eq!(stats.users_today, 2);
        assert_eq!(stats.total_cost_cents_today, 602);
        assert_eq!(stats.over_budget_users, 1);
    }
}
