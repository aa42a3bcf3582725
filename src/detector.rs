/// Cry detector service
///
/// Wires capture, the rolling buffer, the trigger, the state machine and the
/// two network boundaries together. Audio analysis runs on a dedicated
/// `cry-analysis` thread which is the only writer of detector state;
/// everything else reads copies through a watch channel.

use crate::audio_buffer::{AudioBufferError, AudioSample, RollingAudioBuffer};
use crate::capture::{AudioChunk, AudioSource, CaptureConfig, CaptureError, CaptureHandle, ChunkSink};
use crate::classifier::{Classifier, ClassifierConfig, ClassifierError};
use crate::state_machine::{
    ClassificationResult, ClassifyRequest, CryState, DetectionStateMachine, StateMachineConfig,
};
use crate::status::{build_snapshot, PublishReason, PublishSchedule, SnapshotContext, StatusSnapshot, PUBLISH_INTERVAL};
use crate::telemetry::{TelemetryConfig, TelemetrySink};
use crate::trigger::{mean_abs_level, CryTrigger, TriggerConfig, TriggerError};
use crate::wav::encode_wav;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Monitoring already running")]
    AlreadyRunning,

    #[error("Audio capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Audio buffer error: {0}")]
    Buffer(#[from] AudioBufferError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Worker thread error: {0}")]
    Thread(String),
}

/// Configuration for the cry detector service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Sensitivity (0.0 - 1.0). The loudness gate is `sensitivity * 0.1` RMS.
    pub sensitivity: f32,

    /// Rolling buffer length, i.e. the classification snippet length
    pub buffer_secs: f32,

    pub capture: CaptureConfig,
    pub trigger: TriggerConfig,
    pub state_machine: StateMachineConfig,

    /// Heartbeat interval for status publishes
    pub publish_interval: Duration,

    /// Idle wake-up of the analysis loop when no audio arrives
    pub tick_interval: Duration,

    pub classifier: ClassifierConfig,
    pub telemetry: TelemetryConfig,

    /// Bind address of the status/command API
    pub http_addr: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.6,
            buffer_secs: 5.0,
            capture: CaptureConfig::default(),
            trigger: TriggerConfig::default(),
            state_machine: StateMachineConfig::default(),
            publish_interval: PUBLISH_INTERVAL,
            tick_interval: Duration::from_millis(100),
            classifier: ClassifierConfig::default(),
            telemetry: TelemetryConfig::default(),
            http_addr: "0.0.0.0:8888".to_string(),
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(DetectorError::InvalidConfig(
                "Sensitivity must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.buffer_secs <= 0.0 {
            return Err(DetectorError::InvalidConfig(
                "buffer_secs must be greater than 0".to_string(),
            ));
        }

        if self.capture.sample_rate != self.trigger.sample_rate {
            return Err(DetectorError::InvalidConfig(format!(
                "Capture rate {} Hz does not match trigger rate {} Hz",
                self.capture.sample_rate, self.trigger.sample_rate
            )));
        }

        if self.capture.chunk_size == 0 || self.capture.queue_capacity == 0 {
            return Err(DetectorError::InvalidConfig(
                "chunk_size and queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.publish_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(DetectorError::InvalidConfig(
                "publish and tick intervals must be greater than 0".to_string(),
            ));
        }

        self.trigger.validate()?;
        self.classifier.validate()?;

        Ok(())
    }
}

/// Latest state published by the analysis loop
#[derive(Debug, Clone, Default)]
pub struct LiveStatus {
    pub is_monitoring: bool,
    pub monitoring_since: Option<Instant>,
    pub audio_level: f32,
    pub dropped_chunks: u64,
    pub state: CryState,
}

/// Results flowing back into the analysis loop from async tasks
#[derive(Debug)]
enum Completion {
    Classified {
        episode: u64,
        result: Result<ClassificationResult, ClassifierError>,
    },
    Published {
        reason: PublishReason,
        ok: bool,
        started_at: Instant,
    },
}

struct Session {
    capture: CaptureHandle,
    stop_tx: Sender<()>,
    analysis: JoinHandle<AnalysisExit>,
}

/// What the analysis thread hands back on stop
struct AnalysisExit {
    machine: DetectionStateMachine,

    // Status publishes still on their way to the sink
    publishes: Vec<task::JoinHandle<()>>,
}

#[derive(Default)]
struct Lifecycle {
    session: Option<Session>,

    // Parked between sessions so counters survive a restart
    machine: Option<DetectionStateMachine>,
}

/// Main cry detector
pub struct DetectorService {
    config: DetectorConfig,
    trigger: CryTrigger,
    source: Arc<dyn AudioSource>,
    classifier: Arc<dyn Classifier>,
    sink: Option<Arc<dyn TelemetrySink>>,
    buffer: Arc<RollingAudioBuffer>,
    status_tx: Arc<watch::Sender<LiveStatus>>,
    lifecycle: Mutex<Lifecycle>,
}

impl DetectorService {
    /// Create a new detector. Nothing is opened until [`start`](Self::start).
    pub fn new(
        config: DetectorConfig,
        source: Arc<dyn AudioSource>,
        classifier: Arc<dyn Classifier>,
        sink: Option<Arc<dyn TelemetrySink>>,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        info!("Initializing cry detector");
        info!("Sensitivity: {}", config.sensitivity);
        info!(
            "Cry band: {}-{} Hz, window {}s",
            config.trigger.band_low_hz, config.trigger.band_high_hz, config.trigger.window_secs
        );
        info!("Classification enabled: {}", classifier.is_enabled());
        if sink.is_none() {
            info!("No telemetry sink configured, status publishing disabled");
        }

        let trigger = CryTrigger::new(config.trigger.clone())?;
        let buffer = Arc::new(RollingAudioBuffer::new(
            config.capture.sample_rate,
            config.buffer_secs,
        )?);
        let (status_tx, _) = watch::channel(LiveStatus::default());

        Ok(Self {
            config,
            trigger,
            source,
            classifier,
            sink,
            buffer,
            status_tx: Arc::new(status_tx),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Open the audio device and start monitoring.
    ///
    /// Fails with [`DetectorError::AlreadyRunning`] if monitoring is active;
    /// a device failure leaves the detector stopped.
    pub async fn start(&self) -> Result<(), DetectorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        if lifecycle.session.is_some() {
            warn!("Monitoring already running");
            return Err(DetectorError::AlreadyRunning);
        }

        let runtime = Handle::current();

        self.buffer.clear();
        let (chunk_sink, chunk_rx) =
            ChunkSink::new(Arc::clone(&self.buffer), self.config.capture.queue_capacity);
        let dropped = chunk_sink.dropped_counter();

        // Device open can block for up to the open timeout
        let source = Arc::clone(&self.source);
        let capture = tokio::task::spawn_blocking(move || source.start(chunk_sink))
            .await
            .map_err(|e| DetectorError::Thread(e.to_string()))??;

        let mut machine = lifecycle
            .machine
            .take()
            .unwrap_or_else(|| DetectionStateMachine::new(self.config.state_machine.clone()));
        machine.reset_episode();

        let monitoring_since = Instant::now();
        self.status_tx.send_replace(LiveStatus {
            is_monitoring: true,
            monitoring_since: Some(monitoring_since),
            audio_level: 0.0,
            dropped_chunks: 0,
            state: machine.state().clone(),
        });

        let (stop_tx, stop_rx) = bounded(1);
        let (completion_tx, completion_rx) = unbounded();

        let analysis = self.analysis_loop(machine, runtime.clone(), completion_tx, dropped, monitoring_since);
        let channels = AnalysisChannels {
            chunks: chunk_rx,
            completions: completion_rx,
            stop: stop_rx,
        };

        let thread = match std::thread::Builder::new()
            .name("cry-analysis".into())
            .spawn(move || analysis.run(channels))
        {
            Ok(thread) => thread,
            Err(e) => {
                self.status_tx.send_modify(|live| live.is_monitoring = false);
                return Err(DetectorError::Thread(e.to_string()));
            }
        };

        if self.classifier.is_enabled() {
            let classifier = Arc::clone(&self.classifier);
            runtime.spawn(async move {
                let available = classifier.check_health().await;
                info!("Classification service available: {}", available);
            });
        }

        lifecycle.session = Some(Session {
            capture,
            stop_tx,
            analysis: thread,
        });

        info!("Cry monitoring started");
        Ok(())
    }

    /// Stop monitoring. Stopping a stopped detector is a no-op.
    pub async fn stop(&self) -> Result<(), DetectorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let Session {
            capture,
            stop_tx,
            analysis,
        } = match lifecycle.session.take() {
            Some(session) => session,
            None => {
                debug!("Monitoring not running");
                return Ok(());
            }
        };

        let joined = tokio::task::spawn_blocking(move || {
            capture.stop();
            let _ = stop_tx.send(());
            analysis.join()
        })
        .await
        .map_err(|e| DetectorError::Thread(e.to_string()))?;

        let AnalysisExit {
            mut machine,
            publishes,
        } = match joined {
            Ok(exit) => exit,
            Err(_) => {
                error!("Analysis thread panicked, detector state was lost");
                AnalysisExit {
                    machine: DetectionStateMachine::new(self.config.state_machine.clone()),
                    publishes: Vec::new(),
                }
            }
        };
        machine.reset_episode();

        self.status_tx.send_modify(|live| {
            live.is_monitoring = false;
            live.monitoring_since = None;
            live.audio_level = 0.0;
            live.state = machine.state().clone();
        });
        lifecycle.machine = Some(machine);

        info!("Cry monitoring stopped");

        // Earlier records must not land after the final one
        if !publishes.is_empty() {
            debug!("Waiting for {} in-flight status publishes", publishes.len());
        }
        for publish in publishes {
            let _ = publish.await;
        }

        self.publish_final().await;
        Ok(())
    }

    async fn publish_final(&self) {
        let sink = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => return,
        };

        let reason = PublishReason::MonitoringStopped;
        let record = self.status().to_telemetry();
        match tokio::time::timeout(self.config.telemetry.timeout, sink.send(record)).await {
            Ok(Ok(())) => debug!("Status publish ({}) sent", reason),
            Ok(Err(e)) => warn!("Status publish ({}) failed: {}", reason, e),
            Err(_) => warn!("Status publish ({}) timed out", reason),
        }
    }

    /// Current status, as served by `/cry/status`
    pub fn status(&self) -> StatusSnapshot {
        let live = self.status_tx.borrow().clone();

        let ctx = SnapshotContext {
            is_monitoring: live.is_monitoring,
            monitoring_since: live.monitoring_since,
            audio_level: live.audio_level,
            sensitivity: self.config.sensitivity,
            classification_enabled: self.classifier.is_enabled(),
            classification_available: self.classifier.is_available(),
            dropped_chunks: live.dropped_chunks,
            now: Instant::now(),
            now_wall: SystemTime::now(),
        };

        build_snapshot(&live.state, &ctx)
    }

    pub fn is_running(&self) -> bool {
        self.status_tx.borrow().is_monitoring
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn analysis_loop(
        &self,
        machine: DetectionStateMachine,
        runtime: Handle,
        completion_tx: Sender<Completion>,
        dropped: Arc<AtomicU64>,
        monitoring_since: Instant,
    ) -> AnalysisLoop {
        let window_len = self.trigger.window_len();

        AnalysisLoop {
            trigger: self.trigger.clone(),
            sensitivity: self.config.sensitivity,
            machine,
            buffer: Arc::clone(&self.buffer),
            window: VecDeque::with_capacity(window_len),
            window_len,
            runtime,
            classifier: Arc::clone(&self.classifier),
            sink: self.sink.clone(),
            publish_timeout: self.config.telemetry.timeout,
            schedule: PublishSchedule::new(self.config.publish_interval, monitoring_since),
            completion_tx,
            status_tx: Arc::clone(&self.status_tx),
            dropped,
            tick_interval: self.config.tick_interval,
            monitoring_since,
            audio_level: 0.0,
            publishes: Vec::new(),
        }
    }
}

struct AnalysisChannels {
    chunks: Receiver<AudioChunk>,
    completions: Receiver<Completion>,
    stop: Receiver<()>,
}

/// State owned by the `cry-analysis` thread
struct AnalysisLoop {
    trigger: CryTrigger,
    sensitivity: f32,
    machine: DetectionStateMachine,
    buffer: Arc<RollingAudioBuffer>,
    window: VecDeque<AudioSample>,
    window_len: usize,
    runtime: Handle,
    classifier: Arc<dyn Classifier>,
    sink: Option<Arc<dyn TelemetrySink>>,
    publish_timeout: Duration,
    schedule: PublishSchedule,
    completion_tx: Sender<Completion>,
    status_tx: Arc<watch::Sender<LiveStatus>>,
    dropped: Arc<AtomicU64>,
    tick_interval: Duration,
    monitoring_since: Instant,
    audio_level: f32,
    publishes: Vec<task::JoinHandle<()>>,
}

impl AnalysisLoop {
    fn run(mut self, channels: AnalysisChannels) -> AnalysisExit {
        let AnalysisChannels {
            mut chunks,
            completions,
            stop,
        } = channels;

        debug!("Analysis loop started");
        self.refresh_status();
        self.publish(PublishReason::MonitoringStarted);

        let tick = self.tick_interval;
        loop {
            let mut capture_closed = false;

            select! {
                recv(chunks) -> msg => match msg {
                    Ok(chunk) => self.on_chunk(chunk),
                    Err(_) => capture_closed = true,
                },
                recv(completions) -> msg => {
                    if let Ok(completion) = msg {
                        self.on_completion(completion);
                    }
                },
                recv(stop) -> _ => break,
                default(tick) => {},
            }

            if capture_closed {
                debug!("Capture closed the chunk queue");
                chunks = crossbeam_channel::never();
            }

            let now = Instant::now();
            if self.sink.is_some() && self.schedule.heartbeat_due(now) {
                self.publish(PublishReason::Heartbeat);
            }
        }

        let discarded = chunks.try_iter().count();
        if discarded > 0 {
            info!("Discarded {} queued audio chunks on stop", discarded);
        }
        debug!("Analysis loop stopped");

        self.publishes.retain(|publish| !publish.is_finished());
        AnalysisExit {
            machine: self.machine,
            publishes: self.publishes,
        }
    }

    fn on_chunk(&mut self, chunk: AudioChunk) {
        self.audio_level = mean_abs_level(chunk.samples());

        self.window.extend(chunk.samples().iter().copied());
        let excess = self.window.len().saturating_sub(self.window_len);
        self.window.drain(..excess);

        if self.window.len() < self.window_len {
            self.refresh_status();
            return;
        }

        let is_cry = self
            .trigger
            .detect(self.window.make_contiguous(), self.sensitivity);
        let outcome = self.machine.on_trigger(is_cry, chunk.captured_at());

        if let Some(request) = outcome.classify {
            self.request_classification(request);
        }

        self.refresh_status();

        if let Some(transition) = outcome.transition {
            debug!("{:?}, now {}", transition, self.machine.phase());
            self.publish(transition.into());
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Classified { episode, result } => match result {
                Ok(verdict) => {
                    let effect = self.machine.apply_classification(episode, verdict);
                    debug!("Verdict for episode {} applied: {:?}", episode, effect);
                    self.refresh_status();
                    self.publish(PublishReason::Verdict);
                }
                Err(ClassifierError::Disabled) | Err(ClassifierError::Unavailable) => {
                    debug!("Classification skipped for episode {}", episode);
                }
                Err(e) => warn!("Classification failed for episode {}: {}", episode, e),
            },

            Completion::Published {
                reason,
                ok,
                started_at,
            } => self.schedule.record(reason, ok, started_at),
        }
    }

    fn request_classification(&self, request: ClassifyRequest) {
        if !self.classifier.is_enabled() {
            return;
        }

        let samples = match self.buffer.snapshot() {
            Some(samples) => samples,
            None => {
                warn!("Rolling buffer empty, skipping classification");
                return;
            }
        };

        let sample_rate = self.buffer.sample_rate();
        let classifier = Arc::clone(&self.classifier);
        let completion_tx = self.completion_tx.clone();
        let episode = request.episode;

        debug!(
            "Submitting {:.1}s snippet for episode {}",
            samples.len() as f32 / sample_rate as f32,
            episode
        );

        self.runtime.spawn(async move {
            let result = match encode_wav(&samples, sample_rate) {
                Ok(wav) => classifier.classify(wav).await,
                Err(e) => Err(e.into()),
            };
            let _ = completion_tx.send(Completion::Classified { episode, result });
        });
    }

    fn publish(&mut self, reason: PublishReason) {
        let sink = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => return,
        };

        let started_at = Instant::now();
        if reason == PublishReason::Heartbeat {
            self.schedule.begin_heartbeat(started_at);
        }

        let record = self.snapshot(started_at).to_telemetry();
        let completion_tx = self.completion_tx.clone();
        let timeout = self.publish_timeout;

        self.publishes.retain(|publish| !publish.is_finished());
        let publish = self.runtime.spawn(async move {
            let ok = match tokio::time::timeout(timeout, sink.send(record)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Status publish ({}) failed: {}", reason, e);
                    false
                }
                Err(_) => {
                    warn!("Status publish ({}) timed out", reason);
                    false
                }
            };
            let _ = completion_tx.send(Completion::Published {
                reason,
                ok,
                started_at,
            });
        });
        self.publishes.push(publish);
    }

    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        let ctx = SnapshotContext {
            is_monitoring: true,
            monitoring_since: Some(self.monitoring_since),
            audio_level: self.audio_level,
            sensitivity: self.sensitivity,
            classification_enabled: self.classifier.is_enabled(),
            classification_available: self.classifier.is_available(),
            dropped_chunks: self.dropped.load(Ordering::Relaxed),
            now,
            now_wall: SystemTime::now(),
        };

        build_snapshot(self.machine.state(), &ctx)
    }

    fn refresh_status(&self) {
        self.status_tx.send_replace(LiveStatus {
            is_monitoring: true,
            monitoring_since: Some(self.monitoring_since),
            audio_level: self.audio_level,
            dropped_chunks: self.dropped.load(Ordering::Relaxed),
            state: self.machine.state().clone(),
        });
    }
}
