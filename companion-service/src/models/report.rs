//! Models for scheduled report generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal view of a user document; the full profile belongs to the app's
/// CRUD layer and is not read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A completed task/activity, written by the app, read here for statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: String,

    pub category: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
}

/// Statistics derived for one user and one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    /// Activities completed in the period.
    pub completed: i64,

    /// Completions broken down by category.
    #[serde(default)]
    pub by_category: HashMap<String, i64>,

    /// Completions in the preceding period.
    pub previous_completed: i64,

    /// `completed - previous_completed`.
    pub delta: i64,
}

impl PeriodStats {
    pub fn from_activities(current: &[ActivityRecord], previous_completed: i64) -> Self {
        let mut by_category: HashMap<String, i64> = HashMap::new();
        for activity in current {
            *by_category.entry(activity.category.clone()).or_insert(0) += 1;
        }
        let completed = current.len() as i64;
        Self {
            completed,
            by_category,
            previous_completed,
            delta: completed - previous_completed,
        }
    }

    /// The category with the most completions, ties broken alphabetically
    /// so output is stable.
    pub fn top_category(&self) -> Option<&str> {
        self.by_category
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(category, _)| category.as_str())
    }
}

/// One generated report per user per period; existence with
/// `generated == true` is the idempotency guard for the batch jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTask {
    /// `<user>_<period>`, rendered by `DayKey::task_id`/`WeekKey::task_id`.
    #[serde(rename = "_id")]
    pub id: String,

    pub user_id: String,

    /// The period key this report covers.
    pub period: String,

    pub generated: bool,

    pub content: String,

    pub stats: PeriodStats,

    /// True when the content was synthesized locally instead of by the
    /// provider.
    pub fallback_used: bool,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Aggregate outcome of one batch-job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub processed: u32,
    pub skipped: u32,
    pub errors: u32,
}
