/// Status snapshots and publish scheduling
///
/// A [`StatusSnapshot`] is a value copy of the detector state plus derived
/// fields; it is what the HTTP surface returns and what telemetry records
/// are built from. [`PublishSchedule`] decides when a heartbeat is due.

use crate::state_machine::{CryState, Transition};
use crate::telemetry::TelemetryRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default heartbeat interval
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// Point-in-time status of the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub is_monitoring: bool,
    pub cry_detected: bool,
    pub audio_level: f32,
    pub sensitivity: f32,
    pub total_detections: u64,
    pub verified_cries: u64,
    pub false_positives: u64,

    /// Epoch milliseconds of the last cry start
    pub last_cry_time: Option<u64>,

    pub uptime_minutes: f64,

    /// Epoch milliseconds when the snapshot was taken
    pub timestamp: u64,

    pub classification_enabled: bool,
    pub classification_service_available: bool,
    pub dropped_chunks: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_probabilities: Option<BTreeMap<String, f32>>,

    /// Only reported while a cry is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_confidence: Option<f32>,
}

/// Everything besides [`CryState`] that goes into a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    pub is_monitoring: bool,
    pub monitoring_since: Option<Instant>,
    pub audio_level: f32,
    pub sensitivity: f32,
    pub classification_enabled: bool,
    pub classification_available: bool,
    pub dropped_chunks: u64,

    /// Reference point pairing the monotonic and wall clocks
    pub now: Instant,
    pub now_wall: SystemTime,
}

impl SnapshotContext {
    fn epoch_millis(&self, at: Instant) -> u64 {
        let age = self.now.saturating_duration_since(at);
        let wall = self.now_wall.checked_sub(age).unwrap_or(UNIX_EPOCH);
        epoch_millis(wall)
    }
}

/// Build a snapshot from state. No I/O.
pub fn build_snapshot(state: &CryState, ctx: &SnapshotContext) -> StatusSnapshot {
    let uptime = match (ctx.is_monitoring, ctx.monitoring_since) {
        (true, Some(since)) => ctx.now.saturating_duration_since(since),
        _ => Duration::ZERO,
    };

    let classification = state.current_classification.as_ref();

    StatusSnapshot {
        is_monitoring: ctx.is_monitoring,
        cry_detected: state.is_cry_active,
        audio_level: round_to(ctx.audio_level as f64, 3) as f32,
        sensitivity: ctx.sensitivity,
        total_detections: state.total_detections,
        verified_cries: state.verified_cries,
        false_positives: state.false_positives,
        last_cry_time: state.last_cry_start.map(|at| ctx.epoch_millis(at)),
        uptime_minutes: round_to(uptime.as_secs_f64() / 60.0, 1),
        timestamp: epoch_millis(ctx.now_wall),
        classification_enabled: ctx.classification_enabled,
        classification_service_available: ctx.classification_available,
        dropped_chunks: ctx.dropped_chunks,
        classification: classification.and_then(|c| c.label.clone()),
        classification_confidence: classification.and_then(|c| c.label_confidence),
        classification_probabilities: classification.and_then(|c| c.probability_distribution.clone()),
        verified: state.is_cry_active.then_some(state.is_verified_cry),
        verification_confidence: state.is_cry_active.then_some(state.verification_confidence),
    }
}

impl StatusSnapshot {
    /// Flatten into the telemetry key set
    pub fn to_telemetry(&self) -> TelemetryRecord {
        let mut record = TelemetryRecord::new(self.timestamp);

        record
            .insert("cry_detected", self.cry_detected)
            .insert("cry_audio_level", round_to(self.audio_level as f64, 3))
            .insert("cry_sensitivity", self.sensitivity as f64)
            .insert("cry_total_detections", self.total_detections)
            .insert("cry_monitoring", self.is_monitoring)
            .insert("verified_cries", self.verified_cries)
            .insert("false_positives", self.false_positives)
            .insert("timestamp", self.timestamp);

        if let Some(last) = self.last_cry_time {
            record.insert("cry_last_detected", last);
        }

        if let Some(label) = &self.classification {
            record
                .insert("cry_classification", label.as_str())
                .insert(
                    "cry_classification_confidence",
                    self.classification_confidence.unwrap_or(0.0) as f64,
                );

            if let Some(probabilities) = &self.classification_probabilities {
                for (rank, line) in top_probabilities(probabilities, 3).into_iter().enumerate() {
                    record.insert(&format!("cry_classification_top{}", rank + 1), line);
                }
            }
        }

        if self.verified == Some(true) {
            record
                .insert("cry_verified", true)
                .insert(
                    "cry_verification_confidence",
                    self.verification_confidence.unwrap_or(0.0) as f64,
                );
        }

        record
    }
}

/// `"label: 87.50%"` lines, most probable first
fn top_probabilities(probabilities: &BTreeMap<String, f32>, n: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, &f32)> = probabilities.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(a.1));

    ranked
        .into_iter()
        .take(n)
        .map(|(label, p)| format!("{}: {:.2}%", label, p * 100.0))
        .collect()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a status publish was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReason {
    MonitoringStarted,
    CryStarted,
    CryEnded,
    Verdict,
    Heartbeat,
    MonitoringStopped,
}

impl From<Transition> for PublishReason {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::CryStarted => PublishReason::CryStarted,
            Transition::CryEnded => PublishReason::CryEnded,
        }
    }
}

impl fmt::Display for PublishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublishReason::MonitoringStarted => "monitoring_started",
            PublishReason::CryStarted => "cry_started",
            PublishReason::CryEnded => "cry_ended",
            PublishReason::Verdict => "verdict",
            PublishReason::Heartbeat => "heartbeat",
            PublishReason::MonitoringStopped => "monitoring_stopped",
        };
        f.write_str(name)
    }
}

/// Heartbeat timing.
///
/// A heartbeat is due `interval` after the last successful publish of any
/// kind. Only one heartbeat is in flight at a time, and a failed heartbeat
/// waits a full interval before the next attempt.
#[derive(Debug, Clone)]
pub struct PublishSchedule {
    interval: Duration,
    last_success: Instant,
    last_heartbeat_attempt: Option<Instant>,
    heartbeat_in_flight: bool,
}

impl PublishSchedule {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_success: now,
            last_heartbeat_attempt: None,
            heartbeat_in_flight: false,
        }
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        if self.heartbeat_in_flight {
            return false;
        }

        let reference = match self.last_heartbeat_attempt {
            Some(attempt) if attempt > self.last_success => attempt,
            _ => self.last_success,
        };
        now.saturating_duration_since(reference) >= self.interval
    }

    pub fn begin_heartbeat(&mut self, now: Instant) {
        self.heartbeat_in_flight = true;
        self.last_heartbeat_attempt = Some(now);
    }

    /// Record the outcome of a publish that was started at `started_at`
    pub fn record(&mut self, reason: PublishReason, ok: bool, started_at: Instant) {
        if reason == PublishReason::Heartbeat {
            self.heartbeat_in_flight = false;
        }

        if ok && started_at > self.last_success {
            self.last_success = started_at;
        }
    }
}
