/// Rolling audio buffer module
///
/// Keeps the most recent few seconds of mono audio so a snippet can be
/// handed to the classification service when a cry starts.
/// Default: 5 seconds of 16kHz f32 audio (80,000 samples).

use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{debug, trace};

/// Audio sample format (f32 normalized to -1.0 to 1.0)
pub type AudioSample = f32;

/// Capture sample rate
pub const SAMPLE_RATE: usize = 16000;

/// Snippet length kept for classification
pub const BUFFER_DURATION_SECS: f32 = 5.0;

#[derive(Error, Debug)]
pub enum AudioBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(usize),
}

/// Fixed-capacity sliding window over the most recent samples.
///
/// Appends evict the oldest samples once full. A single lock guards both
/// append and snapshot; appends hold it for O(chunk length).
pub struct RollingAudioBuffer {
    ring: CachePadded<Mutex<HeapRb<AudioSample>>>,
    capacity: usize,
    sample_rate: usize,
}

impl RollingAudioBuffer {
    /// Create a buffer holding `duration_secs` of audio at `sample_rate`
    pub fn new(sample_rate: usize, duration_secs: f32) -> Result<Self, AudioBufferError> {
        if sample_rate == 0 {
            return Err(AudioBufferError::InvalidSampleRate(sample_rate));
        }

        let capacity = (sample_rate as f32 * duration_secs) as usize;
        Self::with_capacity(capacity, sample_rate)
    }

    /// Create a buffer with an explicit capacity in samples
    pub fn with_capacity(capacity: usize, sample_rate: usize) -> Result<Self, AudioBufferError> {
        if capacity == 0 {
            return Err(AudioBufferError::InvalidSize(capacity));
        }

        debug!("Creating rolling audio buffer with capacity: {} samples", capacity);

        Ok(Self {
            ring: CachePadded::new(Mutex::new(HeapRb::new(capacity))),
            capacity,
            sample_rate,
        })
    }

    /// Append samples, evicting the oldest ones when the buffer is full.
    pub fn append(&self, samples: &[AudioSample]) {
        // Only the tail of an oversized chunk can survive anyway
        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let mut ring = self.ring.lock();

        let vacant = ring.vacant_len();
        if samples.len() > vacant {
            let to_drop = samples.len() - vacant;
            ring.skip(to_drop);
            trace!("Evicted {} oldest samples", to_drop);
        }

        ring.push_slice(samples);
    }

    /// Copy out the current contents, oldest first.
    ///
    /// Returns `None` if nothing has been appended yet (or after `clear`).
    pub fn snapshot(&self) -> Option<Vec<AudioSample>> {
        let ring = self.ring.lock();

        if ring.is_empty() {
            return None;
        }

        let (head, tail) = ring.as_slices();
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);

        Some(out)
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered audio
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        let occupied = ring.occupied_len();
        ring.skip(occupied);
        debug!("Cleared rolling audio buffer");
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Duration of audio currently buffered (in seconds)
    pub fn duration_secs(&self) -> f32 {
        self.len() as f32 / self.sample_rate as f32
    }
}
