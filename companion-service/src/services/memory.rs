//! In-memory store backend.
//!
//! Implements the same contracts as [`crate::services::database::CompanionDb`]
//! against process memory, for tests and local development without a
//! MongoDB instance. Semantics mirror the Mongo implementation: guarded
//! increments for quota and rate, version-checked swaps for the breaker,
//! first-writer-wins inserts for generation tasks.

use crate::models::{
    ActivityRecord, BreakerState, DayKey, GenerationTask, RateWindow, SafetyFlag, UsageRecord,
    WeekKey, RATE_WINDOW_DOC_ID,
};
use crate::services::flags::FlagStore;
use crate::services::gateway::{CallSource, GatewayStore, QuotaDecision, RateDecision};
use crate::services::reports::ReportStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    usage: HashMap<String, UsageRecord>,
    rate: Option<RateWindow>,
    breaker: Option<BreakerState>,
    flags: Vec<SafetyFlag>,
    users: Vec<String>,
    activities: Vec<ActivityRecord>,
    daily: HashMap<String, GenerationTask>,
    weekly: HashMap<String, GenerationTask>,
    fail_flag_appends: bool,
    failing_activity_users: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    // Seeding and inspection helpers

    pub fn seed_user(&self, user_id: &str) {
        self.state().users.push(user_id.to_string());
    }

    pub fn seed_activity(&self, activity: ActivityRecord) {
        self.state().activities.push(activity);
    }

    pub fn seed_flag(&self, flag: SafetyFlag) {
        self.state().flags.push(flag);
    }

    pub fn set_breaker(&self, breaker: BreakerState) {
        self.state().breaker = Some(breaker);
    }

    pub fn breaker_snapshot(&self) -> BreakerState {
        self.state()
            .breaker
            .clone()
            .unwrap_or_else(BreakerState::initial)
    }

    pub fn flag_count(&self) -> usize {
        self.state().flags.len()
    }

    pub fn daily_task(&self, id: &str) -> Option<GenerationTask> {
        self.state().daily.get(id).cloned()
    }

    pub fn daily_task_count(&self) -> usize {
        self.state().daily.len()
    }

    pub fn weekly_task(&self, id: &str) -> Option<GenerationTask> {
        self.state().weekly.get(id).cloned()
    }

    /// Make flag appends fail, to exercise log-and-continue paths.
    pub fn fail_flag_appends(&self, fail: bool) {
        self.state().fail_flag_appends = fail;
    }

    /// Make activity reads fail for one user, to exercise per-user error
    /// isolation in the batch jobs.
    pub fn fail_activity_reads_for(&self, user_id: &str) {
        self.state()
            .failing_activity_users
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn reserve_quota(
        &self,
        day: &DayKey,
        source: CallSource,
        daily_limit: i64,
    ) -> Result<QuotaDecision, AppError> {
        let mut state = self.state();
        let record = state
            .usage
            .entry(day.usage_doc_id())
            .or_insert_with(|| UsageRecord {
                id: day.usage_doc_id(),
                day: day.to_string(),
                total_calls: 0,
                per_source: HashMap::new(),
                daily_limit,
            });

        if record.total_calls >= daily_limit {
            return Ok(QuotaDecision::Denied);
        }

        record.total_calls += 1;
        *record
            .per_source
            .entry(source.as_str().to_string())
            .or_insert(0) += 1;
        Ok(QuotaDecision::Allowed {
            remaining: record.remaining(),
        })
    }

    async fn usage_for_day(&self, day: &DayKey) -> Result<Option<UsageRecord>, AppError> {
        Ok(self.state().usage.get(&day.usage_doc_id()).cloned())
    }

    async fn admit_rate(
        &self,
        now: DateTime<Utc>,
        window_seconds: i64,
        limit_per_window: i64,
    ) -> Result<RateDecision, AppError> {
        let window_ms = window_seconds * 1000;
        let now_ms = now.timestamp_millis();
        let window_start = (now_ms / window_ms) * window_ms;

        let mut state = self.state();
        if let Some(window) = state.rate.as_mut() {
            if window.window_start_ms == window_start {
                if window.count < limit_per_window {
                    window.count += 1;
                    return Ok(RateDecision::Allowed);
                }
                let window_end_ms = window_start + window_ms;
                let retry_after = (((window_end_ms - now_ms) + 999) / 1000).max(1) as u64;
                return Ok(RateDecision::Denied {
                    retry_after_seconds: retry_after,
                });
            }
        }

        // First call ever, or the window rolled over.
        state.rate = Some(RateWindow {
            id: RATE_WINDOW_DOC_ID.to_string(),
            window_start_ms: window_start,
            count: 1,
            limit_per_window,
        });
        Ok(RateDecision::Allowed)
    }

    async fn rate_window(&self) -> Result<Option<RateWindow>, AppError> {
        Ok(self.state().rate.clone())
    }

    async fn load_breaker(&self) -> Result<BreakerState, AppError> {
        let mut state = self.state();
        Ok(state
            .breaker
            .get_or_insert_with(BreakerState::initial)
            .clone())
    }

    async fn cas_breaker(
        &self,
        expected_version: i64,
        next: &BreakerState,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        let current = state.breaker.get_or_insert_with(BreakerState::initial);
        if current.version != expected_version {
            return Ok(false);
        }
        let mut next = next.clone();
        next.version = expected_version + 1;
        *current = next;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn append(&self, flag: &SafetyFlag) -> Result<(), AppError> {
        let mut state = self.state();
        if state.fail_flag_appends {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "flag appends disabled"
            )));
        }
        state.flags.push(flag.clone());
        Ok(())
    }

    async fn has_recent_flag(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self
            .state()
            .flags
            .iter()
            .any(|f| f.user_id == user_id && f.created_at >= since))
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn list_user_ids(&self) -> Result<Vec<String>, AppError> {
        Ok(self.state().users.clone())
    }

    async fn activities_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let state = self.state();
        if state.failing_activity_users.contains(user_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "activity reads disabled for {}",
                user_id
            )));
        }
        Ok(state
            .activities
            .iter()
            .filter(|a| a.user_id == user_id && a.completed_at >= start && a.completed_at < end)
            .cloned()
            .collect())
    }

    async fn find_daily_summary(
        &self,
        user_id: &str,
        day: &DayKey,
    ) -> Result<Option<GenerationTask>, AppError> {
        Ok(self.state().daily.get(&day.task_id(user_id)).cloned())
    }

    async fn insert_daily_summary(&self, task: &GenerationTask) -> Result<bool, AppError> {
        let mut state = self.state();
        if state.daily.contains_key(&task.id) {
            return Ok(false);
        }
        state.daily.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn find_weekly_report(
        &self,
        user_id: &str,
        week: &WeekKey,
    ) -> Result<Option<GenerationTask>, AppError> {
        Ok(self.state().weekly.get(&week.task_id(user_id)).cloned())
    }

    async fn insert_weekly_report(&self, task: &GenerationTask) -> Result<bool, AppError> {
        let mut state = self.state();
        if state.weekly.contains_key(&task.id) {
            return Ok(false);
        }
        state.weekly.insert(task.id.clone(), task.clone());
        Ok(true)
    }
}
