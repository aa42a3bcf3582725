/// Cry detector library
///
/// Real-time infant cry detection: a spectral trigger over a rolling audio
/// window, an episode state machine, remote verification/classification of
/// cry snippets and status publishing.

pub mod audio_buffer;
pub mod capture;
pub mod classifier;
pub mod detector;
pub mod server;
pub mod state_machine;
pub mod status;
pub mod telemetry;
pub mod trigger;
pub mod wav;

// Re-export main types
pub use audio_buffer::{AudioBufferError, AudioSample, RollingAudioBuffer, SAMPLE_RATE};
pub use capture::{AudioChunk, AudioSource, CaptureConfig, CaptureError, CaptureHandle, ChunkSink, CpalSource};
pub use classifier::{Classifier, ClassifierConfig, ClassifierError, ClassifyResponse, HttpClassifier};
pub use detector::{DetectorConfig, DetectorError, DetectorService, LiveStatus};
pub use server::{router, CommandResponse};
pub use state_machine::{
    ClassificationResult, CryState, DetectionPhase, DetectionStateMachine, StateMachineConfig,
};
pub use status::{build_snapshot, StatusSnapshot};
pub use telemetry::{HttpTelemetrySink, TelemetryConfig, TelemetryError, TelemetryRecord, TelemetrySink, TelemetryValue};
pub use trigger::{CryTrigger, TriggerAnalysis, TriggerConfig, TriggerError};
pub use wav::{encode_wav, WavError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
