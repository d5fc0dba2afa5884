//! Store-driven circuit breaker.
//!
//! Transitions live on [`BreakerState`]; this driver loads the singleton
//! document, computes the next state, and writes it back with a
//! version-checked compare-and-swap. Losing a swap means another handler
//! instance transitioned first, so the loop reloads and re-decides.

use super::GatewayStore;
use crate::models::{BreakerPhase, BreakerState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use service_core::error::AppError;
use std::sync::Arc;

/// Bounded CAS retries; beyond this, contention is resolved conservatively.
const CAS_RETRIES: usize = 4;

/// What the breaker decided about an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker closed, call passes through.
    Pass,
    /// Breaker open (or a trial is already in flight); do not call.
    ShortCircuit,
    /// This caller won the half-open trial slot.
    Trial,
}

pub struct CircuitBreaker {
    store: Arc<dyn GatewayStore>,
    failure_threshold: i64,
    cooldown: ChronoDuration,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn GatewayStore>, failure_threshold: i64, cooldown_seconds: i64) -> Self {
        Self {
            store,
            failure_threshold,
            cooldown: ChronoDuration::seconds(cooldown_seconds),
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// An open breaker whose cooldown has elapsed admits exactly one trial
    /// call: the transition to half-open is a CAS, so concurrent handlers
    /// race for it and all losers stay short-circuited.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<BreakerCheck, AppError> {
        for _ in 0..CAS_RETRIES {
            let state = self.store.load_breaker().await?;
            match state.phase {
                BreakerPhase::Closed => return Ok(BreakerCheck::Pass),
                BreakerPhase::HalfOpen => return Ok(BreakerCheck::ShortCircuit),
                BreakerPhase::Open => {
                    if state.open_and_cooling(now) {
                        return Ok(BreakerCheck::ShortCircuit);
                    }
                    let next = state.to_half_open();
                    if self.store.cas_breaker(state.version, &next).await? {
                        tracing::info!("Circuit breaker half-open, admitting trial call");
                        return Ok(BreakerCheck::Trial);
                    }
                    // Lost the trial race; reload and re-decide.
                }
            }
        }
        Ok(BreakerCheck::ShortCircuit)
    }

    pub async fn record_success(&self) -> Result<(), AppError> {
        for _ in 0..CAS_RETRIES {
            let state = self.store.load_breaker().await?;
            if state.phase == BreakerPhase::Closed && state.consecutive_failures == 0 {
                return Ok(());
            }
            let next = state.on_success();
            if self.store.cas_breaker(state.version, &next).await? {
                if state.phase != BreakerPhase::Closed {
                    tracing::info!("Circuit breaker closed");
                }
                return Ok(());
            }
        }
        tracing::warn!("Gave up recording breaker success after CAS contention");
        Ok(())
    }

    pub async fn record_failure(&self, now: DateTime<Utc>) -> Result<(), AppError> {
        for _ in 0..CAS_RETRIES {
            let state = self.store.load_breaker().await?;
            let next = state.on_failure(now, self.failure_threshold, self.cooldown);
            if self.store.cas_breaker(state.version, &next).await? {
                if next.phase == BreakerPhase::Open && state.phase != BreakerPhase::Open {
                    tracing::warn!(
                        consecutive_failures = next.consecutive_failures,
                        opens_until = ?next.opens_until,
                        "Circuit breaker opened"
                    );
                }
                return Ok(());
            }
        }
        tracing::warn!("Gave up recording breaker failure after CAS contention");
        Ok(())
    }
}
