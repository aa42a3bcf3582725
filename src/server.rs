/// Status and command API
///
/// `GET /cry/status`, `GET /cry/start`, `GET /cry/stop` and an info page at
/// `/`. Handlers only read detector state or call start/stop.

use crate::detector::{DetectorError, DetectorService};
use crate::status::StatusSnapshot;
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Response body of the start/stop commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

impl CommandResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Build the API router around a shared detector
pub fn router(detector: Arc<DetectorService>) -> Router {
    Router::new()
        .route("/", get(api_info))
        .route("/cry/status", get(get_status))
        .route("/cry/start", get(start_monitoring))
        .route("/cry/stop", get(stop_monitoring))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(detector)
}

async fn api_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "Cry Detection API",
        "version": crate::VERSION,
        "endpoints": {
            "/cry/status": "Current detection status",
            "/cry/start": "Start monitoring",
            "/cry/stop": "Stop monitoring",
        }
    }))
}

async fn get_status(State(detector): State<Arc<DetectorService>>) -> Json<StatusSnapshot> {
    Json(detector.status())
}

async fn start_monitoring(State(detector): State<Arc<DetectorService>>) -> Json<CommandResponse> {
    let response = match detector.start().await {
        Ok(()) => CommandResponse::ok("Cry monitoring started"),
        Err(DetectorError::AlreadyRunning) => CommandResponse::failed("Already monitoring"),
        Err(e) => {
            error!("Failed to start monitoring: {}", e);
            CommandResponse::failed(e.to_string())
        }
    };

    info!("Start requested: success={}", response.success);
    Json(response)
}

async fn stop_monitoring(State(detector): State<Arc<DetectorService>>) -> Json<CommandResponse> {
    match detector.stop().await {
        Ok(()) => Json(CommandResponse::ok("Cry monitoring stopped")),
        Err(e) => {
            error!("Error while stopping monitoring: {}", e);
            Json(CommandResponse::failed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioSource, CaptureError, CaptureHandle, ChunkSink};
    use crate::classifier::MockClassifier;
    use crate::detector::DetectorConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    /// Reports the device as missing when `available` is false
    struct ToggleSource {
        available: AtomicBool,
    }

    impl AudioSource for ToggleSource {
        fn start(&self, _sink: ChunkSink) -> Result<CaptureHandle, CaptureError> {
            if !self.available.load(Ordering::SeqCst) {
                return Err(CaptureError::DeviceNotFound("USB Mic".to_string()));
            }
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let thread = std::thread::spawn(move || {
                let _ = stop_rx.recv();
            });
            Ok(CaptureHandle::new(stop_tx, thread))
        }
    }

    fn app(available: bool) -> Router {
        let mut classifier = MockClassifier::new();
        classifier.expect_is_enabled().return_const(false);
        classifier.expect_is_available().return_const(false);

        let detector = DetectorService::new(
            DetectorConfig::default(),
            Arc::new(ToggleSource {
                available: AtomicBool::new(available),
            }),
            Arc::new(classifier),
            None,
        )
        .unwrap();

        router(Arc::new(detector))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_when_stopped() {
        let app = app(true);
        let (status, json) = get_json(&app, "/cry/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["is_monitoring"], false);
        assert_eq!(json["cry_detected"], false);
        assert_eq!(json["total_detections"], 0);
        assert_eq!(json["classification_enabled"], false);
        assert!(json.get("verified").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_commands() {
        let app = app(true);

        let (_, json) = get_json(&app, "/cry/start").await;
        assert_eq!(json["success"], true);

        let (_, json) = get_json(&app, "/cry/status").await;
        assert_eq!(json["is_monitoring"], true);

        let (_, json) = get_json(&app, "/cry/start").await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Already monitoring");

        let (_, json) = get_json(&app, "/cry/stop").await;
        assert_eq!(json["success"], true);

        let (_, json) = get_json(&app, "/cry/stop").await;
        assert_eq!(json["success"], true);

        let (_, json) = get_json(&app, "/cry/status").await;
        assert_eq!(json["is_monitoring"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_reports_device_error() {
        let app = app(false);

        let (_, json) = get_json(&app, "/cry/start").await;
        assert_eq!(json["success"], false);
        assert!(json["message"].as_str().unwrap().contains("USB Mic"));

        let (_, json) = get_json(&app, "/cry/status").await;
        assert_eq!(json["is_monitoring"], false);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let app = app(true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/cry/status")
                    .header("origin", "http://dashboard.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_info_and_unknown_routes() {
        let app = app(true);

        let (status, json) = get_json(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["endpoints"]["/cry/status"], "Current detection status");

        let (status, _) = get_json(&app, "/cry/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
