//! Read-only operational status for parent/operator surfaces.

use crate::models::{BreakerPhase, DayKey};
use crate::services::gateway::GatewayStore;
use crate::startup::AppState;
use axum::{extract::State, Json};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub circuit_breaker: BreakerStatus,
    pub daily_usage: UsageStatus,
    pub rate_limit: RateStatus,
}

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub is_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opens_at: Option<String>,
    pub consecutive_failures: i64,
}

#[derive(Debug, Serialize)]
pub struct UsageStatus {
    pub date: String,
    pub total_calls: i64,
    pub limit: i64,
    pub calls_per_source: HashMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct RateStatus {
    pub current: i64,
    pub limit: i64,
}

pub async fn system_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let breaker = state.store.load_breaker().await?;
    let circuit_breaker = BreakerStatus {
        is_open: breaker.phase == BreakerPhase::Open,
        opens_at: breaker
            .opens_until
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|at| at.to_rfc3339()),
        consecutive_failures: breaker.consecutive_failures,
    };

    let day = DayKey::today(state.config.schedule.offset());
    let usage = state.store.usage_for_day(&day).await?;
    let daily_usage = match usage {
        Some(record) => UsageStatus {
            date: record.day,
            total_calls: record.total_calls,
            limit: record.daily_limit,
            calls_per_source: record.per_source,
        },
        None => UsageStatus {
            date: day.to_string(),
            total_calls: 0,
            limit: state.config.gateway.daily_call_limit,
            calls_per_source: HashMap::new(),
        },
    };

    let window_ms = state.config.gateway.rate_window_seconds * 1000;
    let current_window_start = (Utc::now().timestamp_millis() / window_ms) * window_ms;
    let rate = state.store.rate_window().await?;
    let rate_limit = RateStatus {
        current: rate
            .filter(|w| w.window_start_ms == current_window_start)
            .map(|w| w.count)
            .unwrap_or(0),
        limit: state.config.gateway.rate_limit_per_window,
    };

    Ok(Json(StatusResponse {
        circuit_breaker,
        daily_usage,
        rate_limit,
    }))
}
