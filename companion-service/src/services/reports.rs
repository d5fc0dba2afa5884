//! Scheduled report generation.
//!
//! Nightly and weekly generators iterate every user, derive activity
//! statistics, make one gateway call per user, and persist the result.
//! Idempotency guard: a `GenerationTask` that already exists with
//! `generated == true` is skipped, so re-running a job (or racing a
//! concurrent run) never regenerates or double-writes. Per-user errors are
//! logged and counted; the loop always continues to the next user.

use crate::models::{
    ActivityRecord, DayKey, GenerationTask, JobReport, PeriodStats, WeekKey,
};
use crate::services::fallback;
use crate::services::gateway::{AiCallResult, CallSource, Gateway};
use crate::services::providers::GenerationParams;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use metrics::counter;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;

/// Store operations the batch jobs need.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn list_user_ids(&self) -> Result<Vec<String>, AppError>;

    async fn activities_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, AppError>;

    async fn find_daily_summary(
        &self,
        user_id: &str,
        day: &DayKey,
    ) -> Result<Option<GenerationTask>, AppError>;

    /// Insert a daily summary; returns false when a document for the same
    /// (user, day) already exists (first writer wins).
    async fn insert_daily_summary(&self, task: &GenerationTask) -> Result<bool, AppError>;

    async fn find_weekly_report(
        &self,
        user_id: &str,
        week: &WeekKey,
    ) -> Result<Option<GenerationTask>, AppError>;

    /// Insert a weekly report; returns false when one already exists.
    async fn insert_weekly_report(&self, task: &GenerationTask) -> Result<bool, AppError>;
}

enum UserOutcome {
    Processed,
    Skipped,
}

/// Nightly per-user summary of the previous day.
pub struct DailySummaryJob {
    gateway: Arc<Gateway>,
    store: Arc<dyn ReportStore>,
    offset: FixedOffset,
}

impl DailySummaryJob {
    pub fn new(gateway: Arc<Gateway>, store: Arc<dyn ReportStore>, offset: FixedOffset) -> Self {
        Self {
            gateway,
            store,
            offset,
        }
    }

    /// The day a run started at `now` should summarize: the one just ended.
    pub fn target_day(&self, now: DateTime<Utc>) -> DayKey {
        DayKey::from_utc(now, self.offset).pred()
    }

    pub async fn run(&self, day: DayKey, deadline: Option<Instant>) -> JobReport {
        let mut report = JobReport::default();

        let users = match self.store.list_user_ids().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!(error = %e, "Daily summary job failed to list users");
                report.errors += 1;
                return report;
            }
        };

        tracing::info!(day = %day, user_count = users.len(), "Daily summary job started");

        for user_id in users {
            if deadline_reached(deadline) {
                tracing::warn!(day = %day, "Daily summary job near execution budget, stopping");
                break;
            }

            match self.process_user(&user_id, &day).await {
                Ok(UserOutcome::Processed) => report.processed += 1,
                Ok(UserOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(user_id = %user_id, day = %day, error = %e, "Daily summary failed for user");
                }
            }
        }

        counter!("report_jobs_total", "job" => "daily").increment(1);
        tracing::info!(
            day = %day,
            processed = report.processed,
            skipped = report.skipped,
            errors = report.errors,
            "Daily summary job finished"
        );
        report
    }

    async fn process_user(&self, user_id: &str, day: &DayKey) -> Result<UserOutcome, AppError> {
        if let Some(existing) = self.store.find_daily_summary(user_id, day).await? {
            if existing.generated {
                tracing::debug!(user_id, day = %day, "Daily summary already generated, skipping");
                return Ok(UserOutcome::Skipped);
            }
        }

        let (start, end) = day.utc_range(self.offset);
        let current = self.store.activities_between(user_id, start, end).await?;
        let (prev_start, prev_end) = day.pred().utc_range(self.offset);
        let previous = self
            .store
            .activities_between(user_id, prev_start, prev_end)
            .await?;

        let stats = PeriodStats::from_activities(&current, previous.len() as i64);
        let prompt = daily_prompt(&stats, day);

        let result = self
            .gateway
            .invoke(
                &prompt,
                CallSource::DailySummary,
                Some(user_id),
                &GenerationParams::default(),
            )
            .await;

        let (content, fallback_used) = match result {
            AiCallResult::Success { text, .. } => (text, false),
            other => {
                tracing::info!(user_id, day = %day, outcome = ?other, "Daily summary degraded to fallback content");
                (
                    fallback::daily_summary_fallback(&stats, day.day_of_year()),
                    true,
                )
            }
        };

        let task = GenerationTask {
            id: day.task_id(user_id),
            user_id: user_id.to_string(),
            period: day.to_string(),
            generated: true,
            content,
            stats,
            fallback_used,
            created_at: Utc::now(),
        };

        if self.store.insert_daily_summary(&task).await? {
            Ok(UserOutcome::Processed)
        } else {
            // A concurrent run won the insert; ours is a no-op.
            Ok(UserOutcome::Skipped)
        }
    }
}

/// Weekly per-user report over the previous ISO week.
pub struct WeeklyReportJob {
    gateway: Arc<Gateway>,
    store: Arc<dyn ReportStore>,
    offset: FixedOffset,
}

impl WeeklyReportJob {
    pub fn new(gateway: Arc<Gateway>, store: Arc<dyn ReportStore>, offset: FixedOffset) -> Self {
        Self {
            gateway,
            store,
            offset,
        }
    }

    /// The week a run started at `now` should report on: the one just ended.
    pub fn target_week(&self, now: DateTime<Utc>) -> WeekKey {
        WeekKey::from_day(DayKey::from_utc(now, self.offset)).pred()
    }

    pub async fn run(&self, week: WeekKey, deadline: Option<Instant>) -> JobReport {
        let mut report = JobReport::default();

        let users = match self.store.list_user_ids().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!(error = %e, "Weekly report job failed to list users");
                report.errors += 1;
                return report;
            }
        };

        tracing::info!(week = %week, user_count = users.len(), "Weekly report job started");

        for user_id in users {
            if deadline_reached(deadline) {
                tracing::warn!(week = %week, "Weekly report job near execution budget, stopping");
                break;
            }

            match self.process_user(&user_id, &week).await {
                Ok(UserOutcome::Processed) => report.processed += 1,
                Ok(UserOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(user_id = %user_id, week = %week, error = %e, "Weekly report failed for user");
                }
            }
        }

        counter!("report_jobs_total", "job" => "weekly").increment(1);
        tracing::info!(
            week = %week,
            processed = report.processed,
            skipped = report.skipped,
            errors = report.errors,
            "Weekly report job finished"
        );
        report
    }

    async fn process_user(&self, user_id: &str, week: &WeekKey) -> Result<UserOutcome, AppError> {
        if let Some(existing) = self.store.find_weekly_report(user_id, week).await? {
            if existing.generated {
                tracing::debug!(user_id, week = %week, "Weekly report already generated, skipping");
                return Ok(UserOutcome::Skipped);
            }
        }

        let (start, end) = week.utc_range(self.offset);
        let current = self.store.activities_between(user_id, start, end).await?;
        let (prev_start, prev_end) = week.pred().utc_range(self.offset);
        let previous = self
            .store
            .activities_between(user_id, prev_start, prev_end)
            .await?;

        let stats = PeriodStats::from_activities(&current, previous.len() as i64);
        let prompt = weekly_prompt(&stats, week);

        let result = self
            .gateway
            .invoke(
                &prompt,
                CallSource::WeeklyReport,
                Some(user_id),
                &GenerationParams::default(),
            )
            .await;

        let (content, fallback_used) = match result {
            AiCallResult::Success { text, .. } => (text, false),
            other => {
                tracing::info!(user_id, week = %week, outcome = ?other, "Weekly report degraded to fallback content");
                (
                    fallback::weekly_report_fallback(&stats, week_number(week)),
                    true,
                )
            }
        };

        let task = GenerationTask {
            id: week.task_id(user_id),
            user_id: user_id.to_string(),
            period: week.to_string(),
            generated: true,
            content,
            stats,
            fallback_used,
            created_at: Utc::now(),
        };

        if self.store.insert_weekly_report(&task).await? {
            Ok(UserOutcome::Processed)
        } else {
            Ok(UserOutcome::Skipped)
        }
    }
}

fn deadline_reached(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn week_number(week: &WeekKey) -> u32 {
    // The display form is "<year>-W<week>"; the fallback pool only needs a
    // stable small number.
    week.to_string()
        .rsplit('W')
        .next()
        .and_then(|w| w.parse().ok())
        .unwrap_or(0)
}

fn daily_prompt(stats: &PeriodStats, day: &DayKey) -> String {
    format!(
        "你是兒童陪伴夥伴「小星」。請用 60 字以內、溫暖鼓勵的語氣，\
         為小朋友寫一段今日回顧（{}）。今天完成了 {} 件任務\
         （昨天 {} 件），最常做的類別是{}。請自然地提到這些數字。",
        day,
        stats.completed,
        stats.previous_completed,
        stats.top_category().unwrap_or("休息")
    )
}

fn weekly_prompt(stats: &PeriodStats, week: &WeekKey) -> String {
    format!(
        "你是兒童陪伴夥伴「小星」。請用 100 字以內、溫暖鼓勵的語氣，\
         為小朋友寫一段本週回顧（{}）。本週完成了 {} 件任務\
         （上週 {} 件，變化 {:+}），最常做的類別是{}。請自然地提到這些數字並給予期許。",
        week,
        stats.completed,
        stats.previous_completed,
        stats.delta,
        stats.top_category().unwrap_or("休息")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::services::memory::MemoryStore;
    use crate::services::providers::mock::MockTextProvider;
    use crate::services::providers::ProviderError;
    use chrono::{NaiveDate, TimeZone};

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            daily_call_limit: 100,
            rate_limit_per_window: 100,
            rate_window_seconds: 60,
            breaker_failure_threshold: 5,
            breaker_cooldown_seconds: 300,
            provider_timeout_seconds: 5,
        }
    }

    fn daily_job(provider: Arc<MockTextProvider>, store: Arc<MemoryStore>) -> DailySummaryJob {
        let gateway = Arc::new(Gateway::new(
            provider,
            store.clone(),
            gateway_config(),
            "gemini-2.0-flash".to_string(),
            offset(),
        ));
        DailySummaryJob::new(gateway, store, offset())
    }

    fn day() -> DayKey {
        DayKey::new(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap())
    }

    fn seed_activity(store: &MemoryStore, user: &str, category: &str, day: DayKey) {
        let (start, _) = day.utc_range(offset());
        store.seed_activity(ActivityRecord {
            user_id: user.to_string(),
            category: category.to_string(),
            completed_at: start + chrono::Duration::hours(10),
        });
    }

    #[tokio::test]
    async fn generates_one_summary_per_user() {
        let provider = Arc::new(MockTextProvider::new("今天很棒！"));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1");
        store.seed_user("u2");
        seed_activity(&store, "u1", "reading", day());

        let job = daily_job(provider, store.clone());
        let report = job.run(day(), None).await;

        assert_eq!(
            report,
            JobReport {
                processed: 2,
                skipped: 0,
                errors: 0
            }
        );

        let task = store.daily_task(&day().task_id("u1")).expect("task stored");
        assert!(task.generated);
        assert!(!task.fallback_used);
        assert_eq!(task.stats.completed, 1);
        assert_eq!(task.content, "今天很棒！");
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let provider = Arc::new(MockTextProvider::new("摘要"));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1");

        let job = daily_job(provider.clone(), store.clone());
        let first = job.run(day(), None).await;
        assert_eq!(first.processed, 1);

        let second = job.run(day(), None).await;
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 1);

        // Exactly one provider call happened across both runs.
        assert_eq!(provider.calls(), 1);
        assert_eq!(store.daily_task_count(), 1);
    }

    #[tokio::test]
    async fn provider_failure_persists_interpolated_fallback() {
        let provider = Arc::new(MockTextProvider::new("unused"));
        provider.enqueue(Err(ProviderError::NetworkError("down".to_string())));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1");
        seed_activity(&store, "u1", "chores", day());
        seed_activity(&store, "u1", "chores", day());

        let job = daily_job(provider, store.clone());
        let report = job.run(day(), None).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 0);

        let task = store.daily_task(&day().task_id("u1")).expect("task stored");
        assert!(task.generated);
        assert!(task.fallback_used);
        assert!(task.content.contains('2'));
        assert!(!task.content.is_empty());
    }

    #[tokio::test]
    async fn per_user_store_errors_do_not_abort_the_run() {
        let provider = Arc::new(MockTextProvider::new("摘要"));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("broken");
        store.seed_user("u2");
        store.fail_activity_reads_for("broken");

        let job = daily_job(provider, store.clone());
        let report = job.run(day(), None).await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.processed, 1);
        assert!(store.daily_task(&day().task_id("u2")).is_some());
    }

    #[tokio::test]
    async fn weekly_job_is_idempotent_and_counts_activities() {
        let provider = Arc::new(MockTextProvider::new("本週回顧"));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1");
        let week = WeekKey::from_day(day());
        seed_activity(&store, "u1", "reading", day());

        let gateway = Arc::new(Gateway::new(
            provider.clone(),
            store.clone(),
            gateway_config(),
            "gemini-2.0-flash".to_string(),
            offset(),
        ));
        let job = WeeklyReportJob::new(gateway, store.clone(), offset());

        let first = job.run(week, None).await;
        assert_eq!(first.processed, 1);

        let second = job.run(week, None).await;
        assert_eq!(second.skipped, 1);
        assert_eq!(provider.calls(), 1);

        let task = store
            .weekly_task(&week.task_id("u1"))
            .expect("weekly task stored");
        assert_eq!(task.stats.completed, 1);
        assert_eq!(task.period, week.to_string());
    }

    #[tokio::test]
    async fn expired_deadline_stops_admitting_users() {
        let provider = Arc::new(MockTextProvider::new("摘要"));
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1");
        store.seed_user("u2");

        let job = daily_job(provider.clone(), store);
        let deadline = Instant::now() - std::time::Duration::from_secs(1);
        let report = job.run(day(), Some(deadline)).await;

        assert_eq!(report.processed, 0);
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn target_periods_are_the_ones_just_ended() {
        let provider = Arc::new(MockTextProvider::new("x"));
        let store = Arc::new(MemoryStore::new());
        let job = daily_job(provider, store);

        // 01:00 local on 2026-03-10 (UTC+8) summarizes 2026-03-09.
        let now = chrono::Utc
            .with_ymd_and_hms(2026, 3, 9, 17, 0, 0)
            .unwrap();
        assert_eq!(job.target_day(now).to_string(), "2026-03-09");
    }
}
