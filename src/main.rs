/// Cry detection service binary
///
/// Captures from the microphone, serves the status/command API and
/// publishes status to the configured telemetry endpoint.

use anyhow::Context;
use cry_detector::{
    router, AudioSource, Classifier, ClassifierConfig, CpalSource, DetectorConfig, DetectorService,
    HttpClassifier, HttpTelemetrySink, TelemetryConfig, TelemetrySink,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cry_detector=info,tower_http=info")),
        )
        .init();

    info!("Starting cry detection service v{}", cry_detector::VERSION);

    if let Err(e) = run().await {
        error!("Cry detection service failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Cry detection service stopped");
}

async fn run() -> anyhow::Result<()> {
    let config = load_config().context("Failed to load configuration")?;

    let classifier: Arc<dyn Classifier> = Arc::new(
        HttpClassifier::new(config.classifier.clone())
            .context("Failed to create classification client")?,
    );

    let sink: Option<Arc<dyn TelemetrySink>> = if config.telemetry.is_configured() {
        Some(Arc::new(
            HttpTelemetrySink::new(&config.telemetry).context("Failed to create telemetry sink")?,
        ))
    } else {
        warn!("TB_ACCESS_TOKEN not set, telemetry publishing disabled");
        None
    };

    let source: Arc<dyn AudioSource> = Arc::new(CpalSource::new(config.capture.clone()));

    let detector = Arc::new(
        DetectorService::new(config, source, classifier, sink)
            .context("Failed to create detector")?,
    );
    let http_addr = detector.config().http_addr.clone();

    // Keep serving even if the microphone is missing; /cry/start retries
    if let Err(e) = detector.start().await {
        error!("Failed to start monitoring: {}", e);
    }

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;
    info!("Status API listening on http://{}", http_addr);

    axum::serve(listener, router(Arc::clone(&detector)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down cry detector");
    detector.stop().await.context("Error stopping detector")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Load configuration from environment
fn load_config() -> anyhow::Result<DetectorConfig> {
    let mut config = DetectorConfig::default();

    if let Ok(value) = std::env::var("CRY_SENSITIVITY") {
        config.sensitivity = value
            .parse()
            .with_context(|| format!("Invalid CRY_SENSITIVITY '{}'", value))?;
    }

    config.classifier = match std::env::var("CRY_CLASSIFY_URL") {
        Ok(url) => ClassifierConfig::with_service_url(&url),
        Err(_) => ClassifierConfig::default(),
    };

    if let Ok(value) = std::env::var("CRY_CLASSIFY_ENABLED") {
        config.classifier.enabled = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }

    config.capture.device_name = std::env::var("CRY_AUDIO_DEVICE")
        .ok()
        .filter(|name| !name.trim().is_empty());

    if let Ok(addr) = std::env::var("CRY_HTTP_ADDR") {
        config.http_addr = addr;
    }

    config.telemetry = TelemetryConfig {
        host: std::env::var("TB_HOST").unwrap_or_else(|_| TelemetryConfig::default().host),
        access_token: std::env::var("TB_ACCESS_TOKEN").ok(),
        ..Default::default()
    };

    config.validate()?;

    info!("Sensitivity: {}", config.sensitivity);
    info!(
        "Classification: {} ({})",
        if config.classifier.enabled { "enabled" } else { "disabled" },
        config.classifier.base_url
    );

    Ok(config)
}
