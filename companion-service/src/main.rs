use companion_service::config::CompanionConfig;
use companion_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing; OTLP export only when an endpoint is configured.
    let otlp_endpoint = std::env::var("OTLP_ENDPOINT").ok();
    init_tracing("companion-service", "info", otlp_endpoint.as_deref());

    let config = CompanionConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    app.run_until_stopped().await
}
