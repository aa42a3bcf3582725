/// Real-time cry trigger
///
/// Cheap first-stage detector run on every analysis tick. An RMS gate
/// rejects silence before the spectrum is computed; the spectrum test
/// checks how much of the energy sits in the cry band (300-2000 Hz).
/// Anything that passes is only a candidate: verification happens remotely.

use crate::audio_buffer::{AudioSample, SAMPLE_RATE};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Loudness gate is `sensitivity * LOUDNESS_SCALE`
pub const LOUDNESS_SCALE: f32 = 0.1;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Trigger configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Sample rate of the analysed audio
    pub sample_rate: usize,

    /// Analysis window length in seconds
    pub window_secs: f32,

    /// RMS below this is treated as silence without running the FFT
    pub noise_floor: f32,

    /// Lower edge of the cry band (Hz, inclusive)
    pub band_low_hz: f32,

    /// Upper edge of the cry band (Hz, inclusive)
    pub band_high_hz: f32,

    /// Minimum share of spectral magnitude inside the cry band
    pub band_ratio_threshold: f32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            window_secs: 2.0,
            noise_floor: 0.02,
            band_low_hz: 300.0,
            band_high_hz: 2000.0,
            band_ratio_threshold: 0.3,
        }
    }
}

impl TriggerConfig {
    /// Window length in samples
    pub fn window_len(&self) -> usize {
        (self.sample_rate as f32 * self.window_secs) as usize
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), TriggerError> {
        if self.sample_rate == 0 {
            return Err(TriggerError::InvalidConfig(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.window_len() < 2 {
            return Err(TriggerError::InvalidConfig(
                "window_secs too short for spectral analysis".to_string(),
            ));
        }

        if self.band_low_hz < 0.0 || self.band_low_hz >= self.band_high_hz {
            return Err(TriggerError::InvalidConfig(format!(
                "invalid cry band {}-{} Hz",
                self.band_low_hz, self.band_high_hz
            )));
        }

        if self.band_high_hz > self.sample_rate as f32 / 2.0 {
            return Err(TriggerError::InvalidConfig(
                "band_high_hz must not exceed the Nyquist frequency".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.band_ratio_threshold) {
            return Err(TriggerError::InvalidConfig(
                "band_ratio_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Features computed for one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerAnalysis {
    pub rms: f32,

    /// Share of spectral magnitude in the cry band. Zero when the
    /// window was rejected by the noise floor.
    pub cry_ratio: f32,

    pub is_cry: bool,
}

/// Stateless cry trigger. Holds only the precomputed FFT plan.
#[derive(Clone)]
pub struct CryTrigger {
    config: TriggerConfig,
    window_len: usize,
    fft: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for CryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryTrigger")
            .field("config", &self.config)
            .field("window_len", &self.window_len)
            .finish()
    }
}

impl CryTrigger {
    pub fn new(config: TriggerConfig) -> Result<Self, TriggerError> {
        config.validate()?;

        let window_len = config.window_len();
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(window_len);

        Ok(Self {
            config,
            window_len,
            fft,
        })
    }

    /// Number of samples a window must contain before it is analysed
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Decide cry / no cry for the most recent `window_len` samples.
    pub fn detect(&self, window: &[AudioSample], sensitivity: f32) -> bool {
        self.analyze(window, sensitivity)
            .map(|analysis| analysis.is_cry)
            .unwrap_or(false)
    }

    /// Same as [`detect`](Self::detect) but returns the intermediate values.
    ///
    /// Returns `None` for windows shorter than `window_len`; those are
    /// never transformed.
    pub fn analyze(&self, window: &[AudioSample], sensitivity: f32) -> Option<TriggerAnalysis> {
        if window.len() < self.window_len {
            return None;
        }
        let window = &window[window.len() - self.window_len..];

        let rms = calculate_rms(window);
        if rms < self.config.noise_floor {
            return Some(TriggerAnalysis {
                rms,
                cry_ratio: 0.0,
                is_cry: false,
            });
        }

        let cry_ratio = self.cry_band_ratio(window);
        let is_loud = rms > sensitivity * LOUDNESS_SCALE;
        let has_cry_frequencies = cry_ratio > self.config.band_ratio_threshold;

        trace!(
            "Window analysis: rms={:.4}, cry_ratio={:.3}, loud={}, cry_band={}",
            rms, cry_ratio, is_loud, has_cry_frequencies
        );

        Some(TriggerAnalysis {
            rms,
            cry_ratio,
            is_cry: is_loud && has_cry_frequencies,
        })
    }

    /// Fraction of one-sided spectral magnitude inside the cry band
    fn cry_band_ratio(&self, window: &[AudioSample]) -> f32 {
        let mut spectrum: Vec<Complex32> = window.iter().map(|&x| Complex32::new(x, 0.0)).collect();
        self.fft.process(&mut spectrum);

        let n = spectrum.len();
        let bin_hz = self.config.sample_rate as f32 / n as f32;

        let mut band = 0.0f64;
        let mut total = 0.0f64;
        for (k, bin) in spectrum.iter().take(n / 2 + 1).enumerate() {
            let magnitude = bin.norm() as f64;
            let freq = k as f32 * bin_hz;
            total += magnitude;
            if freq >= self.config.band_low_hz && freq <= self.config.band_high_hz {
                band += magnitude;
            }
        }

        if total > 0.0 {
            (band / total) as f32
        } else {
            0.0
        }
    }
}

/// Root-mean-square level of a window
pub fn calculate_rms(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Mean absolute amplitude, reported as the "audio level"
pub fn mean_abs_level(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples.iter().map(|&s| s.abs() as f64).sum();
    (sum / samples.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::TAU;
    use test_case::test_case;

    const WINDOW: usize = 32_000; // 2 s at 16 kHz

    // Phase in f64 keeps the spectrum clean over a 32k-sample window
    fn generate_tone(frequency: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let cycles = (i as f64 * frequency as f64 / SAMPLE_RATE as f64).fract();
                amplitude * (TAU * cycles).sin() as f32
            })
            .collect()
    }

    /// Two bin-aligned tones: in-band 800 Hz and out-of-band 5 kHz.
    /// The magnitude ratio equals a_in / (a_in + a_out).
    fn generate_mix(a_in: f32, a_out: f32) -> Vec<f32> {
        let inband = generate_tone(800.0, a_in, WINDOW);
        let outband = generate_tone(5000.0, a_out, WINDOW);
        inband.iter().zip(&outband).map(|(a, b)| a + b).collect()
    }

    fn trigger() -> CryTrigger {
        CryTrigger::new(TriggerConfig::default()).unwrap()
    }

    #[test]
    fn test_trigger_config_default() {
        let config = TriggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_len(), WINDOW);
    }

    #[test]
    fn test_trigger_config_validation() {
        let mut config = TriggerConfig::default();
        config.band_low_hz = 2500.0;
        assert!(config.validate().is_err());

        let mut config = TriggerConfig::default();
        config.band_high_hz = 9000.0;
        assert!(config.validate().is_err());

        let mut config = TriggerConfig::default();
        config.window_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test_case(0.0 ; "sensitivity_zero")]
    #[test_case(0.6 ; "sensitivity_default")]
    #[test_case(1.0 ; "sensitivity_max")]
    fn test_silence_never_triggers(sensitivity: f32) {
        let silence = vec![0.0f32; WINDOW];
        assert!(!trigger().detect(&silence, sensitivity));
    }

    #[test]
    fn test_in_band_tone_triggers() {
        let tone = generate_tone(800.0, 0.5, WINDOW);
        let analysis = trigger().analyze(&tone, 0.6).unwrap();

        assert!(analysis.rms > 0.06);
        assert!(analysis.cry_ratio > 0.9);
        assert!(analysis.is_cry);
    }

    #[test]
    fn test_out_of_band_tone_rejected() {
        let tone = generate_tone(5000.0, 0.5, WINDOW);
        let analysis = trigger().analyze(&tone, 0.6).unwrap();

        assert!(analysis.rms > 0.06);
        assert!(analysis.cry_ratio < 0.1);
        assert!(!analysis.is_cry);
    }

    #[test]
    fn test_loud_mixture_above_ratio_threshold() {
        // rms = 0.08, cry_ratio = 0.4
        let k = 0.08 / (0.26f32).sqrt();
        let window = generate_mix(0.4 * k, 0.6 * k);
        let analysis = trigger().analyze(&window, 0.6).unwrap();

        assert_relative_eq!(analysis.rms, 0.08, epsilon = 1e-3);
        assert_relative_eq!(analysis.cry_ratio, 0.4, epsilon = 1e-2);
        assert!(analysis.is_cry);
    }

    #[test]
    fn test_quiet_mixture_below_loudness_gate() {
        // rms = 0.04 is above the noise floor but below 0.6 * 0.1
        let k = 0.04 / (0.26f32).sqrt();
        let window = generate_mix(0.4 * k, 0.6 * k);
        let analysis = trigger().analyze(&window, 0.6).unwrap();

        assert_relative_eq!(analysis.rms, 0.04, epsilon = 1e-3);
        assert!(!analysis.is_cry);

        // Ratio does not rescue it
        let pure = generate_tone(800.0, 0.04 * 2f32.sqrt(), WINDOW);
        assert!(!trigger().detect(&pure, 0.6));
    }

    #[test]
    fn test_higher_sensitivity_lowers_gate() {
        // rms ~0.035: rejected at 0.6, accepted at 0.3
        let tone = generate_tone(800.0, 0.05, WINDOW);
        assert!(!trigger().detect(&tone, 0.6));
        assert!(trigger().detect(&tone, 0.3));
    }

    #[test]
    fn test_short_window_skipped() {
        let tone = generate_tone(800.0, 0.5, WINDOW - 1);
        assert!(trigger().analyze(&tone, 0.6).is_none());
        assert!(!trigger().detect(&tone, 0.6));
    }

    #[test]
    fn test_long_window_uses_most_recent_samples() {
        let mut window = generate_tone(800.0, 0.5, WINDOW);
        window.extend(vec![0.0f32; WINDOW]);

        // Trailing window is silent
        assert!(!trigger().detect(&window, 0.6));
    }

    #[test]
    fn test_rms_and_level() {
        assert_relative_eq!(calculate_rms(&[0.5, -0.5, 0.5, -0.5]), 0.5, epsilon = 1e-6);
        assert_relative_eq!(mean_abs_level(&[0.2, -0.4]), 0.3, epsilon = 1e-6);
        assert_eq!(calculate_rms(&[]), 0.0);
        assert_eq!(mean_abs_level(&[]), 0.0);
    }
}
