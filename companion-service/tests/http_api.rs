//! Integration tests for the HTTP surface.
//!
//! The router runs over the in-memory store and the mock provider, so the
//! suite is hermetic: no MongoDB and no network.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use companion_service::config::{
    AuthConfig, CompanionConfig, GatewayConfig, GoogleConfig, ModelConfig, MongoConfig,
    SafetyConfig, ScheduleConfig,
};
use companion_service::services::memory::MemoryStore;
use companion_service::services::providers::mock::MockTextProvider;
use companion_service::services::providers::ProviderError;
use companion_service::startup::{build_router, build_state};
use std::sync::Arc;
use tower::ServiceExt;

const API_TOKEN: &str = "test-api-token";

fn test_config() -> CompanionConfig {
    CompanionConfig {
        common: service_core::config::Config { port: 0 },
        mongodb: MongoConfig {
            uri: "mongodb://localhost:27017".to_string(),
            database: "companion_test_db".to_string(),
        },
        google: GoogleConfig {
            api_key: "test-api-key".to_string(),
        },
        models: ModelConfig {
            text_model: "gemini-2.0-flash".to_string(),
        },
        gateway: GatewayConfig {
            daily_call_limit: 100,
            rate_limit_per_window: 100,
            rate_window_seconds: 60,
            breaker_failure_threshold: 5,
            breaker_cooldown_seconds: 300,
            provider_timeout_seconds: 5,
        },
        safety: SafetyConfig {
            flag_lookback_days: 7,
            pipeline_timeout_seconds: 30,
            flag_message_max_chars: 200,
        },
        schedule: ScheduleConfig {
            enabled: false,
            utc_offset_hours: 8,
            daily_hour: 1,
            weekly_weekday: "sat".to_string(),
            weekly_hour: 0,
        },
        auth: AuthConfig {
            api_token: API_TOKEN.to_string(),
        },
    }
}

fn test_router(provider: Arc<MockTextProvider>, store: Arc<MemoryStore>) -> Router {
    let state = build_state(
        test_config(),
        store.clone(),
        store.clone(),
        store,
        provider,
        None,
    );
    build_router(state)
}

fn screen_json(level: &str) -> String {
    format!(r#"{{"risk_level":"{}","detected_topics":[],"concerns":[]}}"#, level)
}

fn respond_request(token: Option<&str>, user_id: Option<&str>, message: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/respond")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id);
    }
    builder
        .body(Body::from(
            serde_json::json!({ "message": message }).to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn respond_requires_a_bearer_token() {
    let router = test_router(
        Arc::new(MockTextProvider::new("ok")),
        Arc::new(MemoryStore::new()),
    );

    let response = router
        .oneshot(respond_request(None, Some("u1"), "hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn respond_rejects_a_wrong_token() {
    let router = test_router(
        Arc::new(MockTextProvider::new("ok")),
        Arc::new(MemoryStore::new()),
    );

    let response = router
        .oneshot(respond_request(Some("wrong"), Some("u1"), "hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn respond_requires_caller_identity() {
    let router = test_router(
        Arc::new(MockTextProvider::new("ok")),
        Arc::new(MemoryStore::new()),
    );

    let response = router
        .oneshot(respond_request(Some(API_TOKEN), None, "hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn respond_rejects_an_empty_message() {
    let router = test_router(
        Arc::new(MockTextProvider::new("ok")),
        Arc::new(MemoryStore::new()),
    );

    let response = router
        .clone()
        .oneshot(respond_request(Some(API_TOKEN), Some("u1"), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = router
        .oneshot(respond_request(Some(API_TOKEN), Some("u1"), "   "))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn respond_returns_a_safe_reply() {
    let provider = Arc::new(MockTextProvider::new("unused"));
    provider.enqueue(Ok(screen_json("none")));
    provider.enqueue(Ok("聽起來好好玩！".to_string()));
    let store = Arc::new(MemoryStore::new());
    let router = test_router(provider, store.clone());

    let response = router
        .oneshot(respond_request(
            Some(API_TOKEN),
            Some("u1"),
            "我今天去公園玩，好開心",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["response"], "聽起來好好玩！");
    assert_eq!(body["needs_attention"], false);
    assert_eq!(body["risk_level"], "none");
    assert_eq!(body["trust_mode_triggered"], false);
    assert_eq!(store.flag_count(), 0);
}

#[tokio::test]
async fn risky_message_is_flagged_and_answered() {
    let provider = Arc::new(MockTextProvider::new("小星在這裡陪你。"));
    provider.enqueue(Ok(screen_json("none")));
    let store = Arc::new(MemoryStore::new());
    let router = test_router(provider, store.clone());

    let response = router
        .oneshot(respond_request(Some(API_TOKEN), Some("u1"), "我不想活了"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["risk_level"], "high");
    assert_eq!(body["needs_attention"], true);
    assert_eq!(body["trust_mode_triggered"], true);
    assert!(!body["response"].as_str().unwrap().trim().is_empty());
    assert_eq!(store.flag_count(), 1);
}

#[tokio::test]
async fn provider_outage_still_yields_warm_text() {
    let provider = Arc::new(MockTextProvider::new("unused"));
    provider.enqueue(Err(ProviderError::NetworkError("down".to_string())));
    provider.enqueue(Err(ProviderError::NetworkError("down".to_string())));
    let store = Arc::new(MemoryStore::new());
    let router = test_router(provider, store);

    let response = router
        .oneshot(respond_request(Some(API_TOKEN), Some("u1"), "你好嗎"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(!body["response"].as_str().unwrap().trim().is_empty());
}

#[tokio::test]
async fn status_exposes_breaker_usage_and_rate() {
    let provider = Arc::new(MockTextProvider::new("回覆"));
    provider.enqueue(Ok(screen_json("none")));
    let store = Arc::new(MemoryStore::new());
    let router = test_router(provider, store);

    // One respond call consumes one screen + one reply slot.
    let response = router
        .clone()
        .oneshot(respond_request(Some(API_TOKEN), Some("u1"), "你好"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/status")
        .header(header::AUTHORIZATION, format!("Bearer {}", API_TOKEN))
        .header("x-user-id", "parent-1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["circuit_breaker"]["is_open"], false);
    assert_eq!(body["daily_usage"]["total_calls"], 2);
    assert_eq!(body["daily_usage"]["calls_per_source"]["safety_screen"], 1);
    assert_eq!(body["daily_usage"]["calls_per_source"]["chat_reply"], 1);
    assert_eq!(body["rate_limit"]["current"], 2);
    assert_eq!(body["rate_limit"]["limit"], 100);
}

#[tokio::test]
async fn daily_job_endpoint_is_idempotent() {
    let provider = Arc::new(MockTextProvider::new("今日摘要"));
    let store = Arc::new(MemoryStore::new());
    store.seed_user("u1");
    let router = test_router(provider, store);

    let job_request = || {
        Request::builder()
            .method("POST")
            .uri("/v1/jobs/daily/run")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_TOKEN))
            .header("x-user-id", "ops")
            .body(Body::empty())
            .unwrap()
    };

    let response = router.clone().oneshot(job_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["processed"], 1);
    assert_eq!(body["skipped"], 0);

    let response = router.oneshot(job_request()).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["processed"], 0);
    assert_eq!(body["skipped"], 1);
}

#[tokio::test]
async fn health_and_ready_are_public() {
    let router = test_router(
        Arc::new(MockTextProvider::new("ok")),
        Arc::new(MemoryStore::new()),
    );

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "companion-service");

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
