//! Per-capability feature flags.
//!
//! Resolution order for a feature:
//! 1. runtime override set with [`FeatureFlags::set_enabled`]
//! 2. environment variable `AI_FEATURE_<NAME>` (`1/true/enabled`, `0/false/disabled`)
//! 3. enabled

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::guard::GuardResult;

/// AI capabilities the application gates individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiFeature {
    Ocr,
    DocumentAnalysis,
    ClaimSuggestions,
    PatternAnalysis,
    DocumentCompilation,
    Chat,
}

impl AiFeature {
    pub const ALL: [AiFeature; 6] = [
        AiFeature::Ocr,
        AiFeature::DocumentAnalysis,
        AiFeature::ClaimSuggestions,
        AiFeature::PatternAnalysis,
        AiFeature::DocumentCompilation,
        AiFeature::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AiFeature::Ocr => "ocr",
            AiFeature::DocumentAnalysis => "document_analysis",
            AiFeature::ClaimSuggestions => "claim_suggestions",
            AiFeature::PatternAnalysis => "pattern_analysis",
            AiFeature::DocumentCompilation => "document_compilation",
            AiFeature::Chat => "chat",
        }
    }

    /// Name shown to users in "temporarily unavailable" copy.
    pub fn label(&self) -> &'static str {
        match self {
            AiFeature::Ocr => "Document text extraction",
            AiFeature::DocumentAnalysis => "Document analysis",
            AiFeature::ClaimSuggestions => "Claim suggestions",
            AiFeature::PatternAnalysis => "Pattern analysis",
            AiFeature::DocumentCompilation => "Document compilation",
            AiFeature::Chat => "AI chat",
        }
    }
}

impl fmt::Display for AiFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variable consulted for `feature`.
pub fn env_var_name(feature: &str) -> String {
    let upper: String = feature
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("AI_FEATURE_{upper}")
}

/// Parse a flag value; anything unrecognised is treated as unset.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "enabled" => Some(true),
        "0" | "false" | "disabled" => Some(false),
        _ => None,
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolved state of one flag, for the admin dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlagState {
    pub feature: String,
    pub override_value: Option<bool>,
    pub env_value: Option<bool>,
    pub enabled: bool,
}

pub struct FeatureFlags {
    overrides: RwLock<HashMap<String, bool>>,
    env: EnvLookup,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFlags {
    /// Flags backed by the process environment.
    pub fn new() -> Self {
        Self::with_env(|key| std::env::var(key).ok())
    }

    /// Flags backed by a custom environment lookup.
    pub fn with_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            overrides: RwLock::new(HashMap::new()),
            env: Arc::new(lookup),
        }
    }

    fn override_for(&self, feature: &str) -> Option<bool> {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(feature)
            .copied()
    }

    fn env_for(&self, feature: &str) -> Option<bool> {
        (self.env)(&env_var_name(feature)).and_then(|v| parse_flag(&v))
    }

    pub fn is_enabled(&self, feature: impl AsRef<str>) -> bool {
        let feature = feature.as_ref();
        self.override_for(feature)
            .or_else(|| self.env_for(feature))
            .unwrap_or(true)
    }

    pub fn set_enabled(&self, feature: impl AsRef<str>, enabled: bool) {
        let feature = feature.as_ref();
        info!(feature, enabled, "feature flag override set");
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(feature.to_string(), enabled);
    }

    pub fn clear_override(&self, feature: impl AsRef<str>) {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(feature.as_ref());
    }

    pub fn clear_all_overrides(&self) {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn state(&self, feature: impl AsRef<str>) -> FeatureFlagState {
        let feature = feature.as_ref();
        let override_value = self.override_for(feature);
        let env_value = self.env_for(feature);
        FeatureFlagState {
            feature: feature.to_string(),
            override_value,
            env_value,
            enabled: override_value.or(env_value).unwrap_or(true),
        }
    }

    /// States of every known feature.
    pub fn states(&self) -> Vec<FeatureFlagState> {
        AiFeature::ALL.iter().map(|f| self.state(f.as_str())).collect()
    }
}

/// Result for call sites that short-circuit a disabled feature before invoking the guard.
pub fn feature_disabled_response<T>(feature: impl AsRef<str>) -> GuardResult<T> {
    let feature = feature.as_ref();
    let label = AiFeature::ALL
        .iter()
        .find(|f| f.as_str() == feature)
        .map(|f| f.label().to_string())
        .unwrap_or_else(|| feature.replace('_', " "));
    GuardResult::disabled(format!(
        "{label} is temporarily unavailable. Everything else in your case keeps working."
    ))
}
