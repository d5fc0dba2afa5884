//! Persisted circuit breaker state.
//!
//! The breaker is a single global document because the provider is one
//! shared resource. Handlers are stateless, so every transition is a
//! version-checked compare-and-swap against the store; this module holds
//! the state document and its pure transition functions, the store-driven
//! loop lives in [`crate::services::gateway::breaker`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Singleton id of the breaker document.
pub const BREAKER_DOC_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    #[serde(rename = "_id")]
    pub id: String,

    pub phase: BreakerPhase,

    /// When an open breaker may admit a trial call, epoch milliseconds.
    pub opens_until: Option<i64>,

    pub consecutive_failures: i64,

    /// Compare-and-swap token; bumped by the store on every write.
    pub version: i64,
}

impl BreakerState {
    pub fn initial() -> Self {
        Self {
            id: BREAKER_DOC_ID.to_string(),
            phase: BreakerPhase::Closed,
            opens_until: None,
            consecutive_failures: 0,
            version: 0,
        }
    }

    /// True while the breaker is open and the cooldown has not elapsed.
    pub fn open_and_cooling(&self, now: DateTime<Utc>) -> bool {
        self.phase == BreakerPhase::Open && !self.cooldown_elapsed(now)
    }

    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opens_until {
            Some(until_ms) => now.timestamp_millis() >= until_ms,
            None => true,
        }
    }

    /// Next state after a successful provider call.
    pub fn on_success(&self) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            opens_until: None,
            consecutive_failures: 0,
            ..self.clone()
        }
    }

    /// Next state after a failed provider call.
    pub fn on_failure(&self, now: DateTime<Utc>, threshold: i64, cooldown: Duration) -> Self {
        let failures = self.consecutive_failures + 1;
        match self.phase {
            // A half-open trial failure reopens with a fresh cooldown.
            BreakerPhase::HalfOpen => self.open_at(now, cooldown, failures),
            // A straggler failing while already open keeps the window.
            BreakerPhase::Open => Self {
                consecutive_failures: failures,
                ..self.clone()
            },
            BreakerPhase::Closed => {
                if failures >= threshold {
                    self.open_at(now, cooldown, failures)
                } else {
                    Self {
                        consecutive_failures: failures,
                        ..self.clone()
                    }
                }
            }
        }
    }

    /// Next state when an elapsed open breaker admits its trial call.
    pub fn to_half_open(&self) -> Self {
        Self {
            phase: BreakerPhase::HalfOpen,
            opens_until: None,
            ..self.clone()
        }
    }

    fn open_at(&self, now: DateTime<Utc>, cooldown: Duration, failures: i64) -> Self {
        Self {
            phase: BreakerPhase::Open,
            opens_until: Some((now + cooldown).timestamp_millis()),
            consecutive_failures: failures,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn opens_once_threshold_reached() {
        let cooldown = Duration::seconds(300);
        let mut state = BreakerState::initial();
        for _ in 0..4 {
            state = state.on_failure(at(100), 5, cooldown);
            assert_eq!(state.phase, BreakerPhase::Closed);
        }
        state = state.on_failure(at(100), 5, cooldown);
        assert_eq!(state.phase, BreakerPhase::Open);
        assert_eq!(state.consecutive_failures, 5);
        assert_eq!(state.opens_until, Some((at(100) + cooldown).timestamp_millis()));
        assert!(state.open_and_cooling(at(101)));
        assert!(!state.open_and_cooling(at(100 + 300)));
    }

    #[test]
    fn success_resets_failures() {
        let state = BreakerState::initial()
            .on_failure(at(0), 5, Duration::seconds(60))
            .on_failure(at(1), 5, Duration::seconds(60));
        assert_eq!(state.consecutive_failures, 2);

        let state = state.on_success();
        assert_eq!(state.phase, BreakerPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.opens_until, None);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let cooldown = Duration::seconds(60);
        let mut state = BreakerState::initial();
        for _ in 0..3 {
            state = state.on_failure(at(0), 3, cooldown);
        }
        assert_eq!(state.phase, BreakerPhase::Open);

        let state = state.to_half_open();
        assert_eq!(state.phase, BreakerPhase::HalfOpen);

        let state = state.on_failure(at(500), 3, cooldown);
        assert_eq!(state.phase, BreakerPhase::Open);
        assert_eq!(state.opens_until, Some((at(500) + cooldown).timestamp_millis()));
    }

    #[test]
    fn half_open_success_closes() {
        let state = BreakerState::initial()
            .on_failure(at(0), 1, Duration::seconds(60))
            .to_half_open()
            .on_success();
        assert_eq!(state.phase, BreakerPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }
}
