/// Telemetry sink boundary
///
/// Status records are flat key/value maps with an epoch-millisecond
/// timestamp. The sink reports success or failure; retrying is left to the
/// next publish.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Telemetry endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Telemetry publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Single telemetry value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for TelemetryValue {
    fn from(value: bool) -> Self {
        TelemetryValue::Bool(value)
    }
}

impl From<i64> for TelemetryValue {
    fn from(value: i64) -> Self {
        TelemetryValue::Int(value)
    }
}

impl From<u64> for TelemetryValue {
    fn from(value: u64) -> Self {
        TelemetryValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Float(value)
    }
}

impl From<f32> for TelemetryValue {
    fn from(value: f32) -> Self {
        TelemetryValue::Float(value as f64)
    }
}

impl From<String> for TelemetryValue {
    fn from(value: String) -> Self {
        TelemetryValue::Text(value)
    }
}

impl From<&str> for TelemetryValue {
    fn from(value: &str) -> Self {
        TelemetryValue::Text(value.to_string())
    }
}

/// Flat status record, serialized as `{"ts": .., "values": {..}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub ts: u64,
    pub values: BTreeMap<String, TelemetryValue>,
}

impl TelemetryRecord {
    pub fn new(ts: u64) -> Self {
        Self {
            ts,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<TelemetryValue>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.values.get(key)
    }
}

/// Outbound telemetry boundary
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, record: TelemetryRecord) -> Result<(), TelemetryError>;
}

/// Telemetry configuration (ThingsBoard device HTTP API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub host: String,

    /// Device access token. Publishing is disabled without one.
    pub access_token: Option<String>,

    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            host: "https://thingsboard.cloud".to_string(),
            access_token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl TelemetryConfig {
    pub fn is_configured(&self) -> bool {
        self.access_token
            .as_deref()
            .map_or(false, |token| !token.trim().is_empty())
    }

    pub fn telemetry_url(&self) -> Option<String> {
        let token = self.access_token.as_deref()?.trim();
        if token.is_empty() {
            return None;
        }
        Some(format!(
            "{}/api/v1/{}/telemetry",
            self.host.trim_end_matches('/'),
            token
        ))
    }
}

/// Posts records to a ThingsBoard-style device telemetry endpoint
pub struct HttpTelemetrySink {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTelemetrySink {
    pub fn new(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let url = config.telemetry_url().ok_or_else(|| {
            TelemetryError::InvalidConfig("access token is required".to_string())
        })?;

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        info!("Telemetry publishing to {}", config.host);

        Ok(Self {
            http,
            url,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn send(&self, record: TelemetryRecord) -> Result<(), TelemetryError> {
        let response = self
            .http
            .post(&self.url)
            .json(&record)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelemetryError::Timeout(self.timeout)
                } else {
                    TelemetryError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Status(status.as_u16()));
        }

        debug!("Published {} telemetry values", record.values.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::post, Json, Router};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[test]
    fn test_record_serialization() {
        let mut record = TelemetryRecord::new(1_700_000_000_000);
        record
            .insert("cry_detected", true)
            .insert("cry_total_detections", 3u64)
            .insert("cry_audio_level", 0.125f64)
            .insert("cry_classification", "hungry");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ts": 1_700_000_000_000u64,
                "values": {
                    "cry_audio_level": 0.125,
                    "cry_classification": "hungry",
                    "cry_detected": true,
                    "cry_total_detections": 3
                }
            })
        );
    }

    #[test]
    fn test_config_url() {
        let mut config = TelemetryConfig::default();
        assert!(!config.is_configured());
        assert!(config.telemetry_url().is_none());
        assert!(HttpTelemetrySink::new(&config).is_err());

        config.access_token = Some("abc123".to_string());
        config.host = "http://tb.local:8080/".to_string();
        assert!(config.is_configured());
        assert_eq!(
            config.telemetry_url().unwrap(),
            "http://tb.local:8080/api/v1/abc123/telemetry"
        );
    }

    #[tokio::test]
    async fn test_http_sink_posts_record() {
        let received: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::default();

        let store = Arc::clone(&received);
        let app = Router::new().route(
            "/api/v1/:token/telemetry",
            post(move |Path(token): Path<String>, Json(body): Json<serde_json::Value>| {
                let store = Arc::clone(&store);
                async move {
                    store.lock().await.push((token, body));
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TelemetryConfig {
            host: format!("http://{}", addr),
            access_token: Some("device-token".to_string()),
            ..Default::default()
        };
        let sink = HttpTelemetrySink::new(&config).unwrap();

        let mut record = TelemetryRecord::new(42);
        record.insert("cry_monitoring", true);
        sink.send(record).await.unwrap();

        let received = received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "device-token");
        assert_eq!(received[0].1["ts"], 42);
        assert_eq!(received[0].1["values"]["cry_monitoring"], true);
    }

    #[tokio::test]
    async fn test_http_sink_reports_status_errors() {
        let app = Router::new().route(
            "/api/v1/:token/telemetry",
            post(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TelemetryConfig {
            host: format!("http://{}", addr),
            access_token: Some("bad-token".to_string()),
            ..Default::default()
        };
        let sink = HttpTelemetrySink::new(&config).unwrap();

        assert!(matches!(
            sink.send(TelemetryRecord::new(1)).await,
            Err(TelemetryError::Status(401))
        ));
    }
}
