//! Metering models: the per-day usage ledger and the provider rate window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Singleton id of the rate window document.
pub const RATE_WINDOW_DOC_ID: &str = "global";

/// One document per calendar day, process-wide (never per user).
///
/// Counters only grow within a day; a new day gets a fresh document and the
/// old one is left as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Document id, rendered by [`crate::models::DayKey::usage_doc_id`].
    #[serde(rename = "_id")]
    pub id: String,

    /// Calendar day (YYYY-MM-DD) in the pinned timezone.
    pub day: String,

    /// Total attempted provider calls this day.
    pub total_calls: i64,

    /// Attempted calls broken down by logical source.
    #[serde(default)]
    pub per_source: HashMap<String, i64>,

    /// The cap this record was created under.
    pub daily_limit: i64,
}

impl UsageRecord {
    pub fn remaining(&self) -> i64 {
        (self.daily_limit - self.total_calls).max(0)
    }
}

/// Fixed-window rate counter, singleton document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    #[serde(rename = "_id")]
    pub id: String,

    /// Window start, epoch milliseconds, aligned to the window length.
    pub window_start_ms: i64,

    /// Calls admitted in this window.
    pub count: i64,

    /// The limit this window was created under.
    pub limit_per_window: i64,
}
