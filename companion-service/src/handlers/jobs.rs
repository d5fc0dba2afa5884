//! Manual job triggers, the operator "retry" affordance.
//!
//! Safe to call repeatedly: the jobs themselves skip every (user, period)
//! that already has a generated report.

use crate::models::JobReport;
use crate::startup::AppState;
use axum::{extract::State, Json};
use chrono::Utc;
use service_core::error::AppError;

pub async fn run_daily_job(State(state): State<AppState>) -> Result<Json<JobReport>, AppError> {
    let day = state.daily_job.target_day(Utc::now());
    tracing::info!(day = %day, "Daily summary job triggered manually");
    let report = state.daily_job.run(day, None).await;
    Ok(Json(report))
}

pub async fn run_weekly_job(State(state): State<AppState>) -> Result<Json<JobReport>, AppError> {
    let week = state.weekly_job.target_week(Utc::now());
    tracing::info!(week = %week, "Weekly report job triggered manually");
    let report = state.weekly_job.run(week, None).await;
    Ok(Json(report))
}
