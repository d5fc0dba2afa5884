//! Safety models: risk levels, durable safety flags, and the reply envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered risk classification of a piece of child-authored text.
///
/// The derived ordering is load-bearing: every merge of risk signals is a
/// `max`, so a verdict can be raised but never lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a risk event, appended for later human review.
///
/// Flags are append-only; nothing in this service mutates one after it is
/// written (`reviewed` is toggled by the review dashboard, which is a
/// separate system).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyFlag {
    pub user_id: String,

    /// The offending message, truncated for storage.
    pub message: String,

    pub risk_level: RiskLevel,

    #[serde(default)]
    pub concerns: Vec<String>,

    #[serde(default)]
    pub detected_topics: Vec<String>,

    pub reviewed: bool,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl SafetyFlag {
    pub fn new(
        user_id: impl Into<String>,
        message: &str,
        risk_level: RiskLevel,
        concerns: Vec<String>,
        detected_topics: Vec<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.chars().take(max_chars).collect(),
            risk_level,
            concerns,
            detected_topics,
            reviewed: false,
            created_at: Utc::now(),
        }
    }
}

/// The envelope every caller of the safety pipeline receives.
#[derive(Debug, Clone, Serialize)]
pub struct SafeResponse {
    /// Always non-empty, even when the provider is down.
    pub response: String,

    pub needs_attention: bool,

    pub risk_level: RiskLevel,

    pub trust_mode_triggered: bool,
}
