//! Lifecycle-phase awareness.
//!
//! New users (young accounts or few cases) get longer deadlines, more retries, softened
//! copy and fewer warnings. Established users get tighter deadlines and every warning.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::{duration_ms, PhaseConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPhase {
    Intake,
    Active,
    Power,
}

impl UserPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserPhase::Intake => "intake",
            UserPhase::Active => "active",
            UserPhase::Power => "power",
        }
    }
}

impl fmt::Display for UserPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPhaseInfo {
    pub is_early_stage: bool,
    pub account_age_days: i64,
    pub case_count: u32,
    pub phase: UserPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStyle {
    Calm,
    Standard,
    Concise,
}

/// Behavioural tuning for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAdjustments {
    #[serde(with = "duration_ms")]
    pub ai_timeout: Duration,
    pub max_retries: usize,
    /// Lower is more urgent. Advisory: limiters stay FIFO.
    pub queue_priority: u8,
    pub message_style: MessageStyle,
    pub show_warnings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Budget,
    RateLimit,
    QueueDepth,
    Retry,
    Performance,
    Security,
    DataLoss,
}

impl WarningKind {
    /// Suppressed for early-stage users.
    fn is_noise_for_newcomers(&self) -> bool {
        matches!(
            self,
            WarningKind::Budget
                | WarningKind::RateLimit
                | WarningKind::QueueDepth
                | WarningKind::Retry
                | WarningKind::Performance
        )
    }
}

const CALM_REWRITES: &[(&str, &str)] = &[
    ("Request timed out", "This is taking a little longer than usual"),
    ("timed out", "is taking a little longer than usual"),
    ("Rate limit exceeded", "We're handling a lot of requests right now"),
    ("rate limit", "busy moment"),
    ("Failed to", "We couldn't quite"),
    ("failed", "didn't finish"),
    ("Error", "Something needs another look"),
    ("error", "hiccup"),
    ("Invalid", "Please double-check"),
    ("Please try again", "You can try again whenever you're ready"),
];

/// Classify a user by account age and case count at `now`.
pub fn determine_user_phase_at(
    config: &PhaseConfig,
    now: DateTime<Utc>,
    account_created_at: DateTime<Utc>,
    case_count: u32,
) -> UserPhaseInfo {
    let account_age_days = (now - account_created_at).num_days().max(0);
    let is_early_stage =
        account_age_days < config.early_stage_days || case_count < config.early_stage_cases;
    let phase = if is_early_stage {
        UserPhase::Intake
    } else if account_age_days >= config.power_days || case_count >= config.power_cases {
        UserPhase::Power
    } else {
        UserPhase::Active
    };
    UserPhaseInfo {
        is_early_stage,
        account_age_days,
        case_count,
        phase,
    }
}

pub fn calm_message(message: &str, phase: UserPhase) -> String {
    if phase != UserPhase::Intake {
        return message.to_string();
    }
    CALM_REWRITES
        .iter()
        .fold(message.to_string(), |msg, (from, to)| msg.replace(from, to))
}

pub fn should_show_warning(kind: WarningKind, phase: UserPhase) -> bool {
    phase != UserPhase::Intake || !kind.is_noise_for_newcomers()
}

pub struct PhaseAwareness {
    config: PhaseConfig,
    clock: Arc<dyn Clock>,
}

impl PhaseAwareness {
    pub fn new(config: PhaseConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PhaseConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    pub fn determine_user_phase(
        &self,
        account_created_at: DateTime<Utc>,
        case_count: u32,
    ) -> UserPhaseInfo {
        determine_user_phase_at(&self.config, self.clock.now(), account_created_at, case_count)
    }

    pub fn phase_adjustments(&self, phase: UserPhase) -> &PhaseAdjustments {
        match phase {
            UserPhase::Intake => &self.config.intake,
            UserPhase::Active => &self.config.active,
            UserPhase::Power => &self.config.power,
        }
    }

    pub fn calm_message(&self, message: &str, phase: UserPhase) -> String {
        calm_message(message, phase)
    }

    pub fn should_show_warning(&self, kind: WarningKind, phase: UserPhase) -> bool {
        should_show_warning(kind, phase)
    }
}
