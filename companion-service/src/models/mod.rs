//! Domain models for the companion mediation service.

pub mod breaker;
pub mod keys;
pub mod report;
pub mod safety;
pub mod usage;

pub use breaker::{BreakerPhase, BreakerState, BREAKER_DOC_ID};
pub use keys::{DayKey, WeekKey};
pub use report::{ActivityRecord, GenerationTask, JobReport, PeriodStats, UserRecord};
pub use safety::{RiskLevel, SafeResponse, SafetyFlag};
pub use usage::{RateWindow, UsageRecord, RATE_WINDOW_DOC_ID};
