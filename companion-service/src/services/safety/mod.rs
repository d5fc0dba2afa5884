//! The two-stage content-safety pipeline.
//!
//! Stage 1 screens the message for risk (one gateway call plus the local
//! keyword heuristic plus the sticky floor from recent flags); stage 2
//! generates the reply with a template chosen by the merged verdict. The
//! merge is monotonic (no signal can lower another's level) and the
//! pipeline never returns an empty reply: any degradation resolves to a
//! warm local fallback phrase.

pub mod keywords;
pub mod templates;

use crate::config::SafetyConfig;
use crate::models::{RiskLevel, SafeResponse, SafetyFlag};
use crate::services::fallback;
use crate::services::flags::FlagStore;
use crate::services::gateway::{AiCallResult, CallSource, Gateway};
use crate::services::providers::GenerationParams;
use chrono::Duration as ChronoDuration;
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// What the risk screen is asked to answer. Parsed strictly; anything that
/// does not fit is treated as a degraded screen.
#[derive(Debug, Deserialize)]
struct ScreenVerdict {
    risk_level: RiskLevel,
    #[serde(default)]
    detected_topics: Vec<String>,
    #[serde(default)]
    concerns: Vec<String>,
}

struct PipelineOutcome {
    final_risk: RiskLevel,
    detected_topics: Vec<String>,
    concerns: Vec<String>,
    reply: String,
}

pub struct SafetyPipeline {
    gateway: Arc<Gateway>,
    flags: Arc<dyn FlagStore>,
    lookback: ChronoDuration,
    pipeline_timeout: Duration,
    flag_message_max_chars: usize,
}

impl SafetyPipeline {
    pub fn new(gateway: Arc<Gateway>, flags: Arc<dyn FlagStore>, config: &SafetyConfig) -> Self {
        Self {
            gateway,
            flags,
            lookback: ChronoDuration::days(config.flag_lookback_days),
            pipeline_timeout: Duration::from_secs(config.pipeline_timeout_seconds),
            flag_message_max_chars: config.flag_message_max_chars,
        }
    }

    /// Screen a child's message and produce a safe reply.
    ///
    /// Never fails and never returns an empty reply; every degraded path
    /// resolves to fallback text.
    pub async fn generate_safe_response(&self, user_id: &str, message: &str) -> SafeResponse {
        let (heuristic_risk, heuristic_terms) = keywords::scan(message);

        let outcome = match tokio::time::timeout(
            self.pipeline_timeout,
            self.run_stages(user_id, message, heuristic_risk, &heuristic_terms),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(user_id, "Safety pipeline timed out, using fallback");
                PipelineOutcome {
                    final_risk: heuristic_risk,
                    detected_topics: Vec::new(),
                    concerns: heuristic_terms.clone(),
                    reply: fallback::conversational_fallback().to_string(),
                }
            }
        };

        let needs_attention = outcome.final_risk != RiskLevel::None;

        counter!(
            "safety_verdicts_total",
            "risk" => outcome.final_risk.as_str()
        )
        .increment(1);

        if needs_attention {
            let flag = SafetyFlag::new(
                user_id,
                message,
                outcome.final_risk,
                outcome.concerns.clone(),
                outcome.detected_topics.clone(),
                self.flag_message_max_chars,
            );
            // The flag write must never fail the child-facing reply.
            if let Err(e) = self.flags.append(&flag).await {
                tracing::error!(user_id, error = %e, "Failed to record safety flag");
            }
        }

        // Last line of the no-empty-reply invariant.
        let response = if outcome.reply.trim().is_empty() {
            fallback::conversational_fallback().to_string()
        } else {
            outcome.reply
        };

        SafeResponse {
            response,
            needs_attention,
            risk_level: outcome.final_risk,
            trust_mode_triggered: needs_attention,
        }
    }

    async fn run_stages(
        &self,
        user_id: &str,
        message: &str,
        heuristic_risk: RiskLevel,
        heuristic_terms: &[String],
    ) -> PipelineOutcome {
        // Sticky floor: a recently flagged user starts at Low.
        let since = chrono::Utc::now() - self.lookback;
        let sticky_floor = match self.flags.has_recent_flag(user_id, since).await {
            Ok(true) => {
                tracing::debug!(user_id, "Recent safety flag raises risk floor");
                RiskLevel::Low
            }
            Ok(false) => RiskLevel::None,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Flag lookback failed, floor stays none");
                RiskLevel::None
            }
        };

        // Stage 1: AI risk screen.
        let screen_result = self
            .gateway
            .invoke(
                &templates::risk_screen_prompt(message),
                CallSource::SafetyScreen,
                Some(user_id),
                &screen_params(),
            )
            .await;

        let verdict = match &screen_result {
            AiCallResult::Success { text, .. } => parse_screen_verdict(text),
            _ => {
                tracing::info!(user_id, "Risk screen degraded, relying on local heuristic");
                None
            }
        };

        let ai_risk = verdict
            .as_ref()
            .map(|v| v.risk_level)
            .unwrap_or(RiskLevel::None);

        // Monotonic merge: nothing can lower the verdict.
        let final_risk = ai_risk.max(heuristic_risk).max(sticky_floor);

        let mut concerns: Vec<String> = heuristic_terms.to_vec();
        let mut detected_topics = Vec::new();
        if let Some(v) = verdict {
            concerns.extend(v.concerns);
            detected_topics = v.detected_topics;
        }

        tracing::debug!(
            user_id,
            ai_risk = ai_risk.as_str(),
            heuristic_risk = heuristic_risk.as_str(),
            sticky_floor = sticky_floor.as_str(),
            final_risk = final_risk.as_str(),
            "Risk verdict merged"
        );

        // Stage 2: reply generation with the risk-selected template.
        let reply_result = self
            .gateway
            .invoke(
                &templates::reply_prompt(final_risk, message),
                CallSource::ChatReply,
                Some(user_id),
                &GenerationParams::default(),
            )
            .await;

        let reply = match reply_result {
            AiCallResult::Success { text, .. } if !text.trim().is_empty() => text,
            _ => {
                tracing::info!(user_id, "Reply generation degraded, using fallback phrase");
                fallback::conversational_fallback().to_string()
            }
        };

        PipelineOutcome {
            final_risk,
            detected_topics,
            concerns,
            reply,
        }
    }
}

fn screen_params() -> GenerationParams {
    GenerationParams {
        temperature: Some(0.0),
        max_tokens: Some(256),
        output_schema: Some(templates::RISK_SCREEN_SCHEMA.to_string()),
        ..Default::default()
    }
}

/// Parse the screen's JSON answer, tolerating a markdown code fence.
fn parse_screen_verdict(text: &str) -> Option<ScreenVerdict> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    match serde_json::from_str::<ScreenVerdict>(body) {
        Ok(verdict) => Some(verdict),
        Err(e) => {
            tracing::warn!(error = %e, "Risk screen returned unparseable verdict");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::services::memory::MemoryStore;
    use crate::services::providers::mock::MockTextProvider;
    use crate::services::providers::ProviderError;
    use chrono::{FixedOffset, Utc};

    fn safety_config() -> SafetyConfig {
        SafetyConfig {
            flag_lookback_days: 7,
            pipeline_timeout_seconds: 30,
            flag_message_max_chars: 200,
        }
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            daily_call_limit: 100,
            rate_limit_per_window: 100,
            rate_window_seconds: 60,
            breaker_failure_threshold: 5,
            breaker_cooldown_seconds: 300,
            provider_timeout_seconds: 5,
        }
    }

    fn pipeline_with(
        provider: Arc<MockTextProvider>,
        store: Arc<MemoryStore>,
    ) -> SafetyPipeline {
        let gateway = Arc::new(Gateway::new(
            provider,
            store.clone(),
            gateway_config(),
            "gemini-2.0-flash".to_string(),
            FixedOffset::east_opt(8 * 3600).unwrap(),
        ));
        SafetyPipeline::new(gateway, store, &safety_config())
    }

    fn screen_json(level: &str) -> String {
        format!(
            r#"{{"risk_level":"{}","detected_topics":["test"],"concerns":[]}}"#,
            level
        )
    }

    #[tokio::test]
    async fn happy_message_uses_encouragement_and_no_flag() {
        let provider = Arc::new(MockTextProvider::new("真棒！"));
        provider.enqueue(Ok(screen_json("none")));
        provider.enqueue(Ok("聽起來好好玩！".to_string()));
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline
            .generate_safe_response("u1", "我今天去公園玩，好開心")
            .await;

        assert_eq!(response.risk_level, RiskLevel::None);
        assert!(!response.needs_attention);
        assert!(!response.trust_mode_triggered);
        assert_eq!(response.response, "聽起來好好玩！");
        assert_eq!(store.flag_count(), 0);
    }

    #[tokio::test]
    async fn self_harm_keyword_forces_high_even_when_screen_says_none() {
        let provider = Arc::new(MockTextProvider::new("小星在這裡陪你。"));
        provider.enqueue(Ok(screen_json("none")));
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline.generate_safe_response("u1", "我不想活了").await;

        assert_eq!(response.risk_level, RiskLevel::High);
        assert!(response.needs_attention);
        assert!(response.trust_mode_triggered);
        assert!(!response.response.trim().is_empty());
        assert_eq!(store.flag_count(), 1);
    }

    #[tokio::test]
    async fn screen_verdict_raises_risk_over_clean_heuristic() {
        let provider = Arc::new(MockTextProvider::new("我懂你的感受。"));
        provider.enqueue(Ok(screen_json("medium")));
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline
            .generate_safe_response("u1", "今天心情不太好")
            .await;

        assert_eq!(response.risk_level, RiskLevel::Medium);
        assert!(response.needs_attention);
        assert_eq!(store.flag_count(), 1);
    }

    #[tokio::test]
    async fn recent_flag_raises_floor_to_low() {
        let provider = Arc::new(MockTextProvider::new("小星陪你聊聊。"));
        provider.enqueue(Ok(screen_json("none")));
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(SafetyFlag::new(
            "u1",
            "earlier message",
            RiskLevel::Medium,
            vec![],
            vec![],
            200,
        ));
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline
            .generate_safe_response("u1", "我今天去公園玩，好開心")
            .await;

        assert_eq!(response.risk_level, RiskLevel::Low);
        assert!(response.needs_attention);
        // The new flag is appended on top of the seeded one.
        assert_eq!(store.flag_count(), 2);
    }

    #[tokio::test]
    async fn degraded_reply_stage_still_returns_warm_text() {
        let provider = Arc::new(MockTextProvider::new("unused"));
        provider.enqueue(Ok(screen_json("high")));
        provider.enqueue(Err(ProviderError::NetworkError("down".to_string())));
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline.generate_safe_response("u1", "我好難過").await;

        assert_eq!(response.risk_level, RiskLevel::High);
        assert!(response.needs_attention);
        assert!(!response.response.trim().is_empty());
        assert_eq!(store.flag_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_screen_falls_back_to_heuristic() {
        let provider = Arc::new(MockTextProvider::new("回覆"));
        provider.enqueue(Ok("not json at all".to_string()));
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline
            .generate_safe_response("u1", "我今天去公園玩，好開心")
            .await;

        assert_eq!(response.risk_level, RiskLevel::None);
        assert!(!response.needs_attention);
        assert!(!response.response.is_empty());
    }

    #[tokio::test]
    async fn flag_store_failure_never_breaks_the_reply() {
        let provider = Arc::new(MockTextProvider::new("小星在這裡。"));
        provider.enqueue(Ok(screen_json("high")));
        let store = Arc::new(MemoryStore::new());
        store.fail_flag_appends(true);
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline.generate_safe_response("u1", "我想死").await;

        assert_eq!(response.risk_level, RiskLevel::High);
        assert!(!response.response.trim().is_empty());
        assert_eq!(store.flag_count(), 0);
    }

    #[tokio::test]
    async fn fenced_screen_json_is_parsed() {
        let verdict =
            parse_screen_verdict("```json\n{\"risk_level\":\"low\"}\n```").expect("parses");
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert!(verdict.detected_topics.is_empty());
    }

    #[test]
    fn merge_is_monotonic_over_all_combinations() {
        let levels = [
            RiskLevel::None,
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
        ];
        for ai in levels {
            for heuristic in levels {
                for floor in [RiskLevel::None, RiskLevel::Low] {
                    let merged = ai.max(heuristic).max(floor);
                    assert!(merged >= ai);
                    assert!(merged >= heuristic);
                    assert!(merged >= floor);
                }
            }
        }
    }

    #[tokio::test]
    async fn old_flags_outside_lookback_do_not_raise_floor() {
        let provider = Arc::new(MockTextProvider::new("回覆"));
        provider.enqueue(Ok(screen_json("none")));
        let store = Arc::new(MemoryStore::new());
        let mut old_flag = SafetyFlag::new("u1", "old", RiskLevel::High, vec![], vec![], 200);
        old_flag.created_at = Utc::now() - ChronoDuration::days(30);
        store.seed_flag(old_flag);
        let pipeline = pipeline_with(provider, store.clone());

        let response = pipeline
            .generate_safe_response("u1", "我今天去公園玩，好開心")
            .await;

        assert_eq!(response.risk_level, RiskLevel::None);
        assert!(!response.needs_attention);
    }
}
