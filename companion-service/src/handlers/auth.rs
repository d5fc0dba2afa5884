//! Bearer-token authentication.
//!
//! Session handling lives in the app backend; this service only verifies
//! the shared API token and the caller identity it forwards. Token
//! comparison is constant-time.

use crate::startup::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use subtle::ConstantTimeEq;

/// Header carrying the child's user id, set by the trusted app backend.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let expected = state.config.auth.api_token.as_bytes();
    if token.as_bytes().ct_eq(expected).unwrap_u8() != 1 {
        return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid API token")));
    }

    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing caller identity")))?;

    req.extensions_mut().insert(AuthenticatedUser { user_id });

    Ok(next.run(req).await)
}
