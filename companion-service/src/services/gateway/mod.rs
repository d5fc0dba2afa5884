//! The invocation gateway: the single path to the AI provider.
//!
//! Every provider call is sequenced through three gatekeepers (circuit
//! breaker, daily quota ledger, fixed-window rate limiter) before the
//! request leaves the process. Callers receive a typed [`AiCallResult`]
//! and branch on it; quota, rate, and breaker internals never leak past
//! this module. Shared state lives in the document store behind
//! [`GatewayStore`] because handler instances share no memory.

pub mod breaker;

use crate::config::GatewayConfig;
use crate::models::{BreakerState, DayKey, RateWindow, UsageRecord};
use crate::services::providers::{GenerationParams, ProviderError, TextProvider};
use async_trait::async_trait;
use breaker::{BreakerCheck, CircuitBreaker};
use chrono::{DateTime, FixedOffset, Utc};
use metrics::counter;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;

/// Logical feature making a provider call; quota is tracked per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSource {
    SafetyScreen,
    ChatReply,
    DailySummary,
    WeeklyReport,
}

impl CallSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallSource::SafetyScreen => "safety_screen",
            CallSource::ChatReply => "chat_reply",
            CallSource::DailySummary => "daily_summary",
            CallSource::WeeklyReport => "weekly_report",
        }
    }
}

/// Why a call was stopped before reaching the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    DailyLimit,
    RateLimit { retry_after_seconds: u64 },
    CircuitBreaker,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DailyLimit => "daily_limit",
            BlockReason::RateLimit { .. } => "rate_limit",
            BlockReason::CircuitBreaker => "circuit_breaker",
        }
    }
}

/// How an attempted provider call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Network,
    Api,
    MalformedResponse,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Api => "api",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::Internal => "internal",
        }
    }
}

/// Outcome of one gateway invocation.
#[derive(Debug, Clone)]
pub enum AiCallResult {
    Success {
        text: String,
        source: CallSource,
        model: String,
    },
    Blocked {
        reason: BlockReason,
    },
    Failure {
        kind: FailureKind,
    },
}

/// True for every outcome except `Success`; callers substitute their local
/// fallback content when this holds.
pub fn should_use_fallback(result: &AiCallResult) -> bool {
    !matches!(result, AiCallResult::Success { .. })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { remaining: i64 },
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

/// Store operations the gateway needs. Implementations must perform every
/// counter mutation atomically on the server side (guarded `$inc` or
/// version-checked compare-and-swap), never read-modify-write.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Atomically reserve one call against the daily cap.
    async fn reserve_quota(
        &self,
        day: &DayKey,
        source: CallSource,
        daily_limit: i64,
    ) -> Result<QuotaDecision, AppError>;

    /// Read-only snapshot of a day's usage record.
    async fn usage_for_day(&self, day: &DayKey) -> Result<Option<UsageRecord>, AppError>;

    /// Atomically admit one call into the current rate window.
    async fn admit_rate(
        &self,
        now: DateTime<Utc>,
        window_seconds: i64,
        limit_per_window: i64,
    ) -> Result<RateDecision, AppError>;

    /// Read-only snapshot of the rate window document.
    async fn rate_window(&self) -> Result<Option<RateWindow>, AppError>;

    /// Load (or create) the breaker document.
    async fn load_breaker(&self) -> Result<BreakerState, AppError>;

    /// Replace the breaker state iff its version still matches. Returns
    /// whether the swap happened; the stored version is bumped on success.
    async fn cas_breaker(&self, expected_version: i64, next: &BreakerState)
        -> Result<bool, AppError>;

    /// Store liveness probe.
    async fn ping(&self) -> Result<(), AppError>;
}

/// The invocation gateway.
pub struct Gateway {
    provider: Arc<dyn TextProvider>,
    store: Arc<dyn GatewayStore>,
    breaker: CircuitBreaker,
    settings: GatewayConfig,
    model: String,
    offset: FixedOffset,
}

impl Gateway {
    pub fn new(
        provider: Arc<dyn TextProvider>,
        store: Arc<dyn GatewayStore>,
        settings: GatewayConfig,
        model: String,
        offset: FixedOffset,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            store.clone(),
            settings.breaker_failure_threshold,
            settings.breaker_cooldown_seconds,
        );
        Self {
            provider,
            store,
            breaker,
            settings,
            model,
            offset,
        }
    }

    /// Invoke the provider on behalf of `source`.
    ///
    /// Sequencing is strict: breaker, then quota, then rate, then the
    /// provider call under a timeout. A short-circuited call consumes no
    /// quota and no rate slot.
    pub async fn invoke(
        &self,
        prompt: &str,
        source: CallSource,
        user_id: Option<&str>,
        params: &GenerationParams,
    ) -> AiCallResult {
        let now = Utc::now();

        // 1. Circuit breaker
        match self.breaker.check(now).await {
            Ok(BreakerCheck::Pass) | Ok(BreakerCheck::Trial) => {}
            Ok(BreakerCheck::ShortCircuit) => {
                tracing::info!(source = source.as_str(), "Call short-circuited by open breaker");
                return self.blocked(source, BlockReason::CircuitBreaker);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to check circuit breaker");
                return self.failure(source, FailureKind::Internal);
            }
        }

        // 2. Daily quota
        let day = DayKey::from_utc(now, self.offset);
        match self
            .store
            .reserve_quota(&day, source, self.settings.daily_call_limit)
            .await
        {
            Ok(QuotaDecision::Allowed { remaining }) => {
                tracing::debug!(source = source.as_str(), remaining, "Quota reserved");
            }
            Ok(QuotaDecision::Denied) => {
                tracing::warn!(source = source.as_str(), day = %day, "Daily call limit reached");
                return self.blocked(source, BlockReason::DailyLimit);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reserve quota");
                return self.failure(source, FailureKind::Internal);
            }
        }

        // 3. Rate window
        match self
            .store
            .admit_rate(
                now,
                self.settings.rate_window_seconds,
                self.settings.rate_limit_per_window,
            )
            .await
        {
            Ok(RateDecision::Allowed) => {}
            Ok(RateDecision::Denied {
                retry_after_seconds,
            }) => {
                tracing::warn!(
                    source = source.as_str(),
                    retry_after_seconds,
                    "Rate window exhausted"
                );
                return self.blocked(
                    source,
                    BlockReason::RateLimit {
                        retry_after_seconds,
                    },
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to check rate window");
                return self.failure(source, FailureKind::Internal);
            }
        }

        // 4. Provider call under a timeout
        let timeout = Duration::from_secs(self.settings.provider_timeout_seconds);
        match tokio::time::timeout(timeout, self.provider.generate(prompt, params)).await {
            Ok(Ok(response)) => match response.text.filter(|t| !t.trim().is_empty()) {
                Some(text) => {
                    self.record_success().await;
                    counter!(
                        "gateway_calls_total",
                        "source" => source.as_str(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    AiCallResult::Success {
                        text,
                        source,
                        model: self.model.clone(),
                    }
                }
                None => {
                    tracing::warn!(source = source.as_str(), "Provider returned empty text");
                    self.record_failure().await;
                    self.failure(source, FailureKind::MalformedResponse)
                }
            },
            Ok(Err(err)) => {
                let (kind, counts_toward_breaker) = classify_provider_error(&err);
                tracing::warn!(
                    source = source.as_str(),
                    user_id = user_id.unwrap_or("-"),
                    error = %err,
                    "Provider call failed"
                );
                if counts_toward_breaker {
                    self.record_failure().await;
                }
                self.failure(source, kind)
            }
            Err(_) => {
                tracing::warn!(
                    source = source.as_str(),
                    timeout_seconds = self.settings.provider_timeout_seconds,
                    "Provider call timed out"
                );
                self.record_failure().await;
                self.failure(source, FailureKind::Timeout)
            }
        }
    }

    async fn record_success(&self) {
        if let Err(e) = self.breaker.record_success().await {
            tracing::warn!(error = %e, "Failed to record breaker success");
        }
    }

    async fn record_failure(&self) {
        if let Err(e) = self.breaker.record_failure(Utc::now()).await {
            tracing::warn!(error = %e, "Failed to record breaker failure");
        }
    }

    fn blocked(&self, source: CallSource, reason: BlockReason) -> AiCallResult {
        counter!(
            "gateway_calls_total",
            "source" => source.as_str(),
            "outcome" => reason.as_str()
        )
        .increment(1);
        AiCallResult::Blocked { reason }
    }

    fn failure(&self, source: CallSource, kind: FailureKind) -> AiCallResult {
        counter!(
            "gateway_calls_total",
            "source" => source.as_str(),
            "outcome" => kind.as_str()
        )
        .increment(1);
        AiCallResult::Failure { kind }
    }
}

/// Map a provider error to a failure kind, and decide whether it indicates
/// an unhealthy upstream. A filtered response or a request we built wrong
/// is not the provider's fault and must not push the breaker open.
fn classify_provider_error(err: &ProviderError) -> (FailureKind, bool) {
    match err {
        ProviderError::NetworkError(_) => (FailureKind::Network, true),
        ProviderError::RateLimited => (FailureKind::Api, true),
        ProviderError::ApiError(_) => (FailureKind::Api, true),
        ProviderError::NotConfigured(_) => (FailureKind::Api, true),
        ProviderError::ContentFiltered => (FailureKind::Api, false),
        ProviderError::InvalidRequest(_) => (FailureKind::Api, false),
    }
}
