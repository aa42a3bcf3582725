/// Audio capture boundary
///
/// The device callback does no analysis: every chunk goes into the rolling
/// buffer and onto a bounded work queue for the analysis loop. When the
/// queue is full the oldest queued chunk is dropped so capture never
/// blocks.

use crate::audio_buffer::{AudioSample, RollingAudioBuffer, SAMPLE_RATE};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Audio input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open audio stream: {0}")]
    Stream(String),

    #[error("Audio device did not open within {0:?}")]
    OpenTimeout(Duration),

    #[error("Failed to spawn capture thread: {0}")]
    Thread(String),
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub sample_rate: usize,

    /// Samples per device callback
    pub chunk_size: usize,

    /// Input device name; default input device when unset
    pub device_name: Option<String>,

    pub open_timeout: Duration,

    /// Work queue capacity in chunks
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            chunk_size: 1024, // 64ms at 16kHz
            device_name: None,
            open_timeout: Duration::from_secs(5),
            queue_capacity: 64,
        }
    }
}

/// One device callback worth of mono samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<AudioSample>,
    captured_at: Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<AudioSample>, captured_at: Instant) -> Self {
        Self {
            samples,
            captured_at,
        }
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Producer side handed to an [`AudioSource`]
#[derive(Clone)]
pub struct ChunkSink {
    buffer: Arc<RollingAudioBuffer>,
    tx: Sender<AudioChunk>,
    // Receiver clone used to evict the oldest chunk when the queue is full
    evict: Receiver<AudioChunk>,
    dropped: Arc<AtomicU64>,
}

impl ChunkSink {
    /// Create a sink and the analysis-side receiver
    pub fn new(buffer: Arc<RollingAudioBuffer>, queue_capacity: usize) -> (Self, Receiver<AudioChunk>) {
        let (tx, rx) = bounded(queue_capacity.max(1));

        let sink = Self {
            buffer,
            tx,
            evict: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        (sink, rx)
    }

    /// Deliver one chunk. Never blocks.
    pub fn push(&self, samples: &[AudioSample]) {
        if samples.is_empty() {
            return;
        }

        self.buffer.append(samples);

        let mut chunk = AudioChunk::new(samples.to_vec(), Instant::now());
        for _ in 0..2 {
            match self.tx.try_send(chunk) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.evict.try_recv().is_ok() {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped % 100 == 1 {
                            warn!("Analysis queue full, dropped {} chunks so far", dropped);
                        }
                    }
                    chunk = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Chunks evicted from the work queue so far
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

/// Keeps a capture running; stopping joins the capture thread.
pub struct CaptureHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// `thread` must exit once `stop_tx` sends or is dropped
    pub fn new(stop_tx: Sender<()>, thread: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Audio device boundary
pub trait AudioSource: Send + Sync {
    /// Open the device and start delivering chunks to `sink`
    fn start(&self, sink: ChunkSink) -> Result<CaptureHandle, CaptureError>;
}

/// Microphone capture through cpal.
///
/// cpal streams are not `Send`, so the stream lives on its own
/// `audio-capture` thread for its whole lifetime.
pub struct CpalSource {
    config: CaptureConfig,
}

impl CpalSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl AudioSource for CpalSource {
    fn start(&self, sink: ChunkSink) -> Result<CaptureHandle, CaptureError> {
        let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_stream(&config, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on stop request or when the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                info!("Audio capture stream closed");
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        match ready_rx.recv_timeout(self.config.open_timeout) {
            Ok(Ok(())) => Ok(CaptureHandle::new(stop_tx, thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                // Thread exits on its own once the driver returns
                drop(stop_tx);
                Err(CaptureError::OpenTimeout(self.config.open_timeout))
            }
        }
    }
}

fn open_stream(config: &CaptureConfig, sink: ChunkSink) -> Result<cpal::Stream, CaptureError> {
    use cpal::traits::{DeviceTrait, StreamTrait};

    let host = cpal::default_host();
    let device = select_device(&host, config.device_name.as_deref())?;
    info!(
        "Using audio device: {}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );

    let mut stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate as u32),
        buffer_size: cpal::BufferSize::Fixed(config.chunk_size as u32),
    };

    let stream = match build_input_stream(&device, &stream_config, sink.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Fixed buffer size rejected ({}), using device default", e);
            stream_config.buffer_size = cpal::BufferSize::Default;
            build_input_stream(&device, &stream_config, sink)?
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    info!(
        "Audio capture started: {}Hz mono, {} samples per chunk",
        config.sample_rate, config.chunk_size
    );

    Ok(stream)
}

fn build_input_stream(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    sink: ChunkSink,
) -> Result<cpal::Stream, CaptureError> {
    use cpal::traits::DeviceTrait;

    device
        .build_input_stream(
            stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| sink.push(data),
            |err| error!("Audio capture error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(wanted) = name {
        let mut devices = host
            .input_devices()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        return devices
            .find(|device| device.name().map_or(false, |n| n == wanted))
            .ok_or_else(|| CaptureError::DeviceNotFound(wanted.to_string()));
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    debug!("No default input device, scanning for any input");
    host.input_devices()
        .map_err(|e| CaptureError::Stream(e.to_string()))?
        .find(|device| device.default_input_config().is_ok())
        .ok_or(CaptureError::NoInputDevice)
}
