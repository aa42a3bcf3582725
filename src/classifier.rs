/// Classification service client
///
/// Sends a WAV snippet to the remote cry verification/classification
/// service. Service health is cached: a failed health check or transport
/// error marks the service unavailable, and cries are not submitted again
/// until the next health check (at most once per `health_ttl`).

use crate::state_machine::ClassificationResult;
use crate::wav::WavError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Classification disabled")]
    Disabled,

    #[error("Classification service unavailable")]
    Unavailable,

    #[error("Classification request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Service reported failure: {0}")]
    Rejected(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Snippet encoding failed: {0}")]
    Encode(#[from] WavError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Classification client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub enabled: bool,

    /// Service root; `/health` and `/classify` are appended
    pub base_url: String,

    /// How long a health check result is trusted
    pub health_ttl: Duration,

    pub health_timeout: Duration,

    pub request_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8890".to_string(),
            health_ttl: Duration::from_secs(60),
            health_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClassifierConfig {
    /// Build from either the service root or its `/classify` endpoint URL
    pub fn with_service_url(url: &str) -> Self {
        let base = url.trim_end_matches('/');
        let base = base.strip_suffix("/classify").unwrap_or(base);

        Self {
            base_url: base.to_string(),
            ..Default::default()
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    pub fn classify_url(&self) -> String {
        format!("{}/classify", self.base_url)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if !self.enabled {
            return Ok(());
        }

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ClassifierError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }

        if self.request_timeout.is_zero() || self.health_timeout.is_zero() {
            return Err(ClassifierError::InvalidConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Wire format of `POST /classify`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    #[serde(default)]
    pub success: bool,

    pub is_cry: Option<bool>,

    pub cry_confidence: Option<f32>,

    pub classification: Option<String>,

    pub classification_confidence: Option<f32>,

    pub probabilities: Option<BTreeMap<String, f32>>,

    pub message: Option<String>,
}

impl ClassifyResponse {
    /// Interpret the response as a verdict.
    ///
    /// `success=false` and a missing `is_cry` are not verdicts. A verified
    /// cry without a non-empty `classification` carries no label.
    pub fn into_result(self) -> Result<ClassificationResult, ClassifierError> {
        if !self.success {
            return Err(ClassifierError::Rejected(
                self.message.unwrap_or_else(|| "no message".to_string()),
            ));
        }

        let is_cry = self
            .is_cry
            .ok_or_else(|| ClassifierError::Malformed("missing is_cry".to_string()))?;

        let verification_confidence = unit_interval(self.cry_confidence.unwrap_or(0.0));

        let label = if is_cry {
            self.classification
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
        } else {
            None
        };

        let (label_confidence, probability_distribution) = if label.is_some() {
            (
                self.classification_confidence.map(unit_interval),
                self.probabilities,
            )
        } else {
            (None, None)
        };

        Ok(ClassificationResult {
            is_verified_cry: is_cry,
            verification_confidence,
            label,
            label_confidence,
            probability_distribution,
        })
    }
}

fn unit_interval(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Boundary to the verification/classification service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Last known service availability (no network access)
    fn is_available(&self) -> bool;

    /// Probe the service and refresh the cached availability
    async fn check_health(&self) -> bool;

    /// Submit a WAV snippet
    async fn classify(&self, wav: Bytes) -> Result<ClassificationResult, ClassifierError>;
}

#[derive(Debug, Default)]
struct HealthCache {
    available: bool,
    last_check: Option<Instant>,
}

/// HTTP implementation of [`Classifier`]
pub struct HttpClassifier {
    http: reqwest::Client,
    config: ClassifierConfig,
    health: Mutex<HealthCache>,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifierError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .connect_timeout(config.health_timeout)
            .timeout(config.request_timeout)
            .build()?;

        info!("Classification service: {} (enabled: {})", config.base_url, config.enabled);

        Ok(Self {
            http,
            config,
            health: Mutex::new(HealthCache::default()),
        })
    }

    fn health_is_stale(&self) -> bool {
        let health = self.health.lock();
        health
            .last_check
            .map_or(true, |checked| checked.elapsed() > self.config.health_ttl)
    }

    fn record_health(&self, available: bool) {
        let mut health = self.health.lock();
        health.available = available;
        health.last_check = Some(Instant::now());
    }

    fn mark_unavailable(&self) {
        self.health.lock().available = false;
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn is_available(&self) -> bool {
        self.health.lock().available
    }

    async fn check_health(&self) -> bool {
        let result = self
            .http
            .get(self.config.health_url())
            .timeout(self.config.health_timeout)
            .send()
            .await;

        let available = match result {
            Ok(response) => {
                let ok = response.status() == reqwest::StatusCode::OK;
                if !ok {
                    warn!("Classification service health check returned {}", response.status());
                }
                ok
            }
            Err(e) => {
                warn!("Classification service health check failed: {}", e);
                false
            }
        };

        self.record_health(available);
        debug!("Classification service available: {}", available);

        available
    }

    async fn classify(&self, wav: Bytes) -> Result<ClassificationResult, ClassifierError> {
        if !self.config.enabled {
            return Err(ClassifierError::Disabled);
        }

        if self.health_is_stale() {
            self.check_health().await;
        }

        if !self.is_available() {
            warn!("Classification service not available, skipping classification");
            return Err(ClassifierError::Unavailable);
        }

        let part = Part::bytes(wav.to_vec())
            .file_name("cry.wav")
            .mime_str("audio/wav")?;
        let form = Form::new().part("file", part);

        let response = match self
            .http
            .post(self.config.classify_url())
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.mark_unavailable();
                if e.is_timeout() {
                    return Err(ClassifierError::Timeout(self.config.request_timeout));
                }
                return Err(ClassifierError::Transport(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.mark_unavailable();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ClassifyResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.mark_unavailable();
                return Err(ClassifierError::Malformed(e.to_string()));
            }
        };

        if let Some(message) = body.message.as_deref() {
            info!("Classification result: {}", message);
        }

        body.into_result()
    }
}
