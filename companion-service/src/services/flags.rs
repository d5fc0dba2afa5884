//! Durable safety flag storage.

use crate::models::SafetyFlag;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

/// Append-only store of safety flags with a recency lookback.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Append a flag for later human review.
    async fn append(&self, flag: &SafetyFlag) -> Result<(), AppError>;

    /// Whether the user has any flag created at or after `since`.
    async fn has_recent_flag(&self, user_id: &str, since: DateTime<Utc>)
        -> Result<bool, AppError>;
}
