use chrono::FixedOffset;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

/// Default global daily cap on provider calls, shared by every feature.
const DEFAULT_DAILY_CALL_LIMIT: i64 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct CompanionConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub mongodb: MongoConfig,
    pub google: GoogleConfig,
    pub models: ModelConfig,
    pub gateway: GatewayConfig,
    pub safety: SafetyConfig,
    pub schedule: ScheduleConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Model used for both the risk screen and reply generation
    /// (e.g., gemini-2.0-flash)
    pub text_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Global daily cap on provider calls across all sources.
    pub daily_call_limit: i64,
    /// Maximum provider calls admitted per rate window.
    pub rate_limit_per_window: i64,
    /// Rate window length in seconds.
    pub rate_window_seconds: i64,
    /// Consecutive failures before the circuit breaker opens.
    pub breaker_failure_threshold: i64,
    /// How long the breaker stays open before admitting a trial call.
    pub breaker_cooldown_seconds: i64,
    /// Per-call timeout on the provider request.
    pub provider_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    /// A safety flag within this many days raises the risk floor to Low.
    pub flag_lookback_days: i64,
    /// Wall-clock bound on the whole two-stage pipeline.
    pub pipeline_timeout_seconds: u64,
    /// Flagged messages are truncated to this many characters.
    pub flag_message_max_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Pinned timezone for day boundaries and job trigger times.
    pub utc_offset_hours: i32,
    /// Local hour at which the nightly summary job fires.
    pub daily_hour: u32,
    /// Local weekday on which the weekly report job fires (e.g., "sat").
    pub weekly_weekday: String,
    /// Local hour at which the weekly report job fires.
    pub weekly_hour: u32,
}

impl ScheduleConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .expect("utc_offset_hours out of range (must be within +/-13)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token presented by the trusted app backend.
    pub api_token: String,
}

impl CompanionConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        Ok(CompanionConfig {
            common: common_config,
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("companion_db"), is_prod)?,
            },
            google: GoogleConfig {
                api_key: get_env("GOOGLE_API_KEY", None, is_prod)?,
            },
            models: ModelConfig {
                text_model: get_env("COMPANION_TEXT_MODEL", Some("gemini-2.0-flash"), is_prod)?,
            },
            gateway: GatewayConfig {
                daily_call_limit: parse_env(
                    "GATEWAY_DAILY_CALL_LIMIT",
                    DEFAULT_DAILY_CALL_LIMIT,
                    is_prod,
                )?,
                rate_limit_per_window: parse_env("GATEWAY_RATE_LIMIT_PER_WINDOW", 10, is_prod)?,
                rate_window_seconds: parse_env("GATEWAY_RATE_WINDOW_SECONDS", 60, is_prod)?,
                breaker_failure_threshold: parse_env("GATEWAY_BREAKER_THRESHOLD", 5, is_prod)?,
                breaker_cooldown_seconds: parse_env("GATEWAY_BREAKER_COOLDOWN_SECONDS", 300, is_prod)?,
                provider_timeout_seconds: parse_env("GATEWAY_PROVIDER_TIMEOUT_SECONDS", 30, is_prod)?,
            },
            safety: SafetyConfig {
                flag_lookback_days: parse_env("SAFETY_FLAG_LOOKBACK_DAYS", 7, is_prod)?,
                pipeline_timeout_seconds: parse_env("SAFETY_PIPELINE_TIMEOUT_SECONDS", 50, is_prod)?,
                flag_message_max_chars: parse_env("SAFETY_FLAG_MESSAGE_MAX_CHARS", 200, is_prod)?,
            },
            schedule: ScheduleConfig {
                enabled: parse_env("SCHEDULE_ENABLED", true, is_prod)?,
                utc_offset_hours: parse_env("SCHEDULE_UTC_OFFSET_HOURS", 8, is_prod)?,
                daily_hour: parse_env("SCHEDULE_DAILY_HOUR", 1, is_prod)?,
                weekly_weekday: get_env("SCHEDULE_WEEKLY_WEEKDAY", Some("sat"), is_prod)?,
                weekly_hour: parse_env("SCHEDULE_WEEKLY_HOUR", 0, is_prod)?,
            },
            auth: AuthConfig {
                api_token: get_env("COMPANION_API_TOKEN", None, is_prod)?,
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let raw = get_env(key, Some(&default.to_string()), is_prod)?;
    Ok(raw.parse().unwrap_or(default))
}
