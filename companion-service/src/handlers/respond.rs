//! The primary entry point: screen a child's message and reply safely.

use crate::handlers::auth::AuthenticatedUser;
use crate::models::SafeResponse;
use crate::startup::AppState;
use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct RespondRequest {
    #[validate(length(min = 1, max = 2000, message = "message must be 1-2000 characters"))]
    pub message: String,
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<SafeResponse>, AppError> {
    req.validate()?;
    let message = req.message.trim();
    if message.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "message must not be blank"
        )));
    }

    tracing::info!(
        user_id = %user.user_id,
        message_chars = message.chars().count(),
        "Processing child message"
    );

    let response = state
        .pipeline
        .generate_safe_response(&user.user_id, message)
        .await;

    Ok(Json(response))
}
