//! Timezone-pinned job scheduler.
//!
//! One tokio task per job, each sleeping until the next fire time in the
//! configured local timezone (daily at a fixed hour, weekly on a fixed
//! weekday). Cancellation-aware so shutdown never interrupts a sleep with
//! a half-started run.

use crate::config::ScheduleConfig;
use crate::services::reports::{DailySummaryJob, WeeklyReportJob};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Headroom under a typical 10-minute serverless execution budget; a run
/// stops admitting new users past this point and relies on the next
/// invocation's idempotency check.
const JOB_DEADLINE: Duration = Duration::from_secs(540);

pub struct JobScheduler {
    token: CancellationToken,
}

impl JobScheduler {
    pub fn start(
        daily: Arc<DailySummaryJob>,
        weekly: Arc<WeeklyReportJob>,
        config: &ScheduleConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let offset = config.offset();

        let daily_hour = config.daily_hour;
        let daily_token = token.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_daily_run(now, offset, daily_hour);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!(next_run = %next, "Daily summary job scheduled");

                tokio::select! {
                    _ = daily_token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        let day = daily.target_day(Utc::now());
                        let deadline = Instant::now() + JOB_DEADLINE;
                        daily.run(day, Some(deadline)).await;
                    }
                }
            }
            tracing::info!("Daily job scheduler stopped");
        });

        let weekday = config
            .weekly_weekday
            .parse::<Weekday>()
            .unwrap_or(Weekday::Sat);
        let weekly_hour = config.weekly_hour;
        let weekly_token = token.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_weekly_run(now, offset, weekday, weekly_hour);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!(next_run = %next, "Weekly report job scheduled");

                tokio::select! {
                    _ = weekly_token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        let week = weekly.target_week(Utc::now());
                        let deadline = Instant::now() + JOB_DEADLINE;
                        weekly.run(week, Some(deadline)).await;
                    }
                }
            }
            tracing::info!("Weekly job scheduler stopped");
        });

        Self { token }
    }

    pub fn shutdown(&self) {
        tracing::info!("Stopping job schedulers");
        self.token.cancel();
    }
}

/// Next occurrence of `hour:00` local time strictly after `now`.
pub fn next_daily_run(now: DateTime<Utc>, offset: FixedOffset, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).expect("valid fire time");
    let mut date = now.with_timezone(&offset).date_naive();
    loop {
        let candidate = offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .expect("fixed offsets have no DST gaps")
            .with_timezone(&Utc);
        if candidate > now {
            return candidate;
        }
        date = date.succ_opt().expect("date overflow");
    }
}

/// Next occurrence of `weekday` at `hour:00` local time strictly after `now`.
pub fn next_weekly_run(
    now: DateTime<Utc>,
    offset: FixedOffset,
    weekday: Weekday,
    hour: u32,
) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).expect("valid fire time");
    let mut date = now.with_timezone(&offset).date_naive();
    loop {
        if date.weekday() == weekday {
            let candidate = offset
                .from_local_datetime(&date.and_time(time))
                .single()
                .expect("fixed offsets have no DST gaps")
                .with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().expect("date overflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taipei() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn daily_run_fires_at_local_one_am() {
        // 2026-03-10T16:30Z == 2026-03-11T00:30 local; next 01:00 local is
        // thirty minutes later.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 16, 30, 0).unwrap();
        let next = next_daily_run(now, taipei(), 1);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 17, 0, 0).unwrap());
    }

    #[test]
    fn daily_run_skips_to_tomorrow_when_already_past() {
        // 02:00 local: today's 01:00 already passed.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let next = next_daily_run(now, taipei(), 1);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 17, 0, 0).unwrap());
    }

    #[test]
    fn weekly_run_lands_on_the_configured_weekday() {
        // 2026-03-10 is a Tuesday; next Saturday 00:00 local (UTC+8) is
        // 2026-03-13T16:00Z.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        let next = next_weekly_run(now, taipei(), Weekday::Sat, 0);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 13, 16, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&taipei()).weekday(), Weekday::Sat);
    }
}
