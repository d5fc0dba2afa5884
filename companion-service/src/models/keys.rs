//! Structured period keys.
//!
//! Document ids for period-scoped records are rendered only here, so the
//! rest of the crate never concatenates date strings by hand.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};
use std::fmt;

/// A calendar day in the service's pinned timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn today(offset: FixedOffset) -> Self {
        Self::from_utc(Utc::now(), offset)
    }

    pub fn from_utc(at: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self(at.with_timezone(&offset).date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// The previous calendar day.
    pub fn pred(&self) -> Self {
        Self(self.0.pred_opt().unwrap_or(self.0))
    }

    pub fn day_of_year(&self) -> u32 {
        self.0.ordinal()
    }

    /// Id of the process-wide usage document for this day.
    pub fn usage_doc_id(&self) -> String {
        format!("global_{}", self.0.format("%Y-%m-%d"))
    }

    /// Id of a user's daily summary document.
    pub fn task_id(&self, user_id: &str) -> String {
        format!("{}_{}", user_id, self.0.format("%Y-%m-%d"))
    }

    /// UTC half-open range [start, end) of this day in the pinned timezone.
    pub fn utc_range(&self, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = local_midnight(self.0, offset);
        let end = local_midnight(self.0.checked_add_days(Days::new(1)).unwrap_or(self.0), offset);
        (start, end)
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// An ISO week in the service's pinned timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeekKey {
    year: i32,
    week: u32,
}

impl WeekKey {
    pub fn from_day(day: DayKey) -> Self {
        let iso = day.date().iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn this_week(offset: FixedOffset) -> Self {
        Self::from_day(DayKey::today(offset))
    }

    /// The preceding ISO week.
    pub fn pred(&self) -> Self {
        let monday = self.monday();
        Self::from_day(DayKey::new(
            monday.checked_sub_days(Days::new(7)).unwrap_or(monday),
        ))
    }

    /// Id of a user's weekly report document.
    pub fn task_id(&self, user_id: &str) -> String {
        format!("{}_{}", user_id, self)
    }

    /// UTC half-open range [start, end) of this ISO week in the pinned timezone.
    pub fn utc_range(&self, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
        let monday = self.monday();
        let start = local_midnight(monday, offset);
        let end = local_midnight(
            monday.checked_add_days(Days::new(7)).unwrap_or(monday),
            offset,
        );
        (start, end)
    }

    fn monday(&self) -> NaiveDate {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
            .expect("ISO week derived from a valid date")
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time of day");
    offset
        .from_local_datetime(&naive)
        .single()
        .expect("fixed offsets have no DST gaps")
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taipei() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn day_key_renders_usage_and_task_ids() {
        let day = DayKey::new(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(day.usage_doc_id(), "global_2026-03-09");
        assert_eq!(day.task_id("user-1"), "user-1_2026-03-09");
        assert_eq!(day.to_string(), "2026-03-09");
    }

    #[test]
    fn day_key_respects_pinned_timezone() {
        // 2026-03-09T20:00Z is already 03-10 in UTC+8.
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 20, 0, 0).unwrap();
        let day = DayKey::from_utc(at, taipei());
        assert_eq!(day.to_string(), "2026-03-10");
    }

    #[test]
    fn day_key_utc_range_covers_local_day() {
        let day = DayKey::new(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        let (start, end) = day.utc_range(taipei());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 9, 16, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 10, 16, 0, 0).unwrap());
    }

    #[test]
    fn week_key_formats_and_rolls_back() {
        let day = DayKey::new(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        let week = WeekKey::from_day(day);
        assert_eq!(week.to_string(), "2026-W01");
        assert_eq!(week.pred().to_string(), "2025-W52");
        assert_eq!(week.task_id("user-1"), "user-1_2026-W01");
    }
}
