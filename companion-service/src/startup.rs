//! Application startup and lifecycle management.
//!
//! Wires the store, the provider, the gateway, the safety pipeline, and
//! the batch jobs into one `AppState`, builds the HTTP router, and runs
//! the server with the job scheduler alongside it.

use crate::config::CompanionConfig;
use crate::handlers;
use crate::services::flags::FlagStore;
use crate::services::gateway::{Gateway, GatewayStore};
use crate::services::providers::gemini::{GeminiConfig, GeminiTextProvider};
use crate::services::providers::TextProvider;
use crate::services::reports::{DailySummaryJob, ReportStore, WeeklyReportJob};
use crate::services::safety::SafetyPipeline;
use crate::services::scheduler::JobScheduler;
use crate::services::CompanionDb;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware};
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

/// Per-IP admits per minute at the HTTP edge; the provider-level limiter
/// behind the gateway is separate and store-backed.
const EDGE_RATE_LIMIT_PER_MIN: u32 = 120;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: CompanionConfig,
    pub store: Arc<dyn GatewayStore>,
    pub pipeline: Arc<SafetyPipeline>,
    pub daily_job: Arc<DailySummaryJob>,
    pub weekly_job: Arc<WeeklyReportJob>,
    pub metrics: Option<PrometheusHandle>,
}

/// Assemble the state from its seams; tests pass in-memory stores and a
/// mock provider here.
pub fn build_state(
    config: CompanionConfig,
    gateway_store: Arc<dyn GatewayStore>,
    flag_store: Arc<dyn FlagStore>,
    report_store: Arc<dyn ReportStore>,
    provider: Arc<dyn TextProvider>,
    metrics: Option<PrometheusHandle>,
) -> AppState {
    let offset = config.schedule.offset();
    let gateway = Arc::new(Gateway::new(
        provider,
        gateway_store.clone(),
        config.gateway.clone(),
        config.models.text_model.clone(),
        offset,
    ));
    let pipeline = Arc::new(SafetyPipeline::new(
        gateway.clone(),
        flag_store,
        &config.safety,
    ));
    let daily_job = Arc::new(DailySummaryJob::new(
        gateway.clone(),
        report_store.clone(),
        offset,
    ));
    let weekly_job = Arc::new(WeeklyReportJob::new(gateway, report_store, offset));

    AppState {
        config,
        store: gateway_store,
        pipeline,
        daily_job,
        weekly_job,
        metrics,
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "companion-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "companion-service",
                "error": e.to_string()
            })),
        ),
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Build the full router; exposed for integration tests.
pub fn build_router(state: AppState) -> Router {
    let ip_limiter = create_ip_rate_limiter(EDGE_RATE_LIMIT_PER_MIN, 60);

    let api = Router::new()
        .route("/v1/respond", post(handlers::respond::respond))
        .route("/v1/status", get(handlers::status::system_status))
        .route("/v1/jobs/daily/run", post(handlers::jobs::run_daily_job))
        .route("/v1/jobs/weekly/run", post(handlers::jobs::run_weekly_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::auth::auth_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            ip_limiter,
            ip_rate_limit_middleware,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CompanionConfig) -> Result<Self, AppError> {
        let db = CompanionDb::connect(&config.mongodb.uri, &config.mongodb.database)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                e
            })?;

        db.initialize_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            e
        })?;
        let db = Arc::new(db);

        let provider: Arc<dyn TextProvider> = Arc::new(GeminiTextProvider::new(GeminiConfig {
            api_key: config.google.api_key.clone(),
            model: config.models.text_model.clone(),
        }));
        tracing::info!(
            model = %config.models.text_model,
            "Initialized Gemini text provider"
        );

        let metrics = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Prometheus recorder not installed");
                None
            }
        };

        let state = build_state(
            config.clone(),
            db.clone(),
            db.clone(),
            db,
            provider,
            metrics,
        );

        // Port 0 = random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "companion-service bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = if self.state.config.schedule.enabled {
            Some(JobScheduler::start(
                self.state.daily_job.clone(),
                self.state.weekly_job.clone(),
                &self.state.config.schedule,
            ))
        } else {
            tracing::info!("Job scheduler disabled by configuration");
            None
        };

        let router = build_router(self.state);

        let result = axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }

        result
    }
}
