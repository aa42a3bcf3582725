/// WAV encoding for classification snippets
///
/// The classification service expects a standard 16-bit linear PCM mono
/// WAV file. Encoding happens fully in memory.

use crate::audio_buffer::AudioSample;
use bytes::Bytes;
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("No audio to encode")]
    EmptyAudio,

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(usize),

    #[error("WAV encoding failed: {0}")]
    Encode(#[from] hound::Error),
}

/// Encode normalized f32 samples as 16-bit PCM mono WAV.
///
/// Samples outside [-1.0, 1.0] are clipped.
pub fn encode_wav(samples: &[AudioSample], sample_rate: usize) -> Result<Bytes, WavError> {
    if samples.is_empty() {
        return Err(WavError::EmptyAudio);
    }

    let sample_rate = u32::try_from(sample_rate)
        .ok()
        .filter(|&rate| rate > 0)
        .ok_or(WavError::InvalidSampleRate(sample_rate))?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // 44-byte canonical header + 2 bytes per sample
    let mut wav_data = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut wav_data), spec)?;

        for &sample in samples {
            writer.write_sample(to_pcm16(sample))?;
        }

        writer.finalize()?;
    }

    debug!("Encoded {} samples into {} byte WAV", samples.len(), wav_data.len());

    Ok(Bytes::from(wav_data))
}

#[inline]
fn to_pcm16(sample: AudioSample) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::SAMPLE_RATE;

    #[test]
    fn test_encode_header_and_length() {
        let samples = vec![0.0f32; 1600];
        let wav = encode_wav(&samples, SAMPLE_RATE).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 1600 * 2);
    }

    #[test]
    fn test_encode_round_trips_through_reader() {
        let samples = vec![0.5f32, -0.5, 1.0, -1.0, 2.0, -3.0];
        let wav = encode_wav(&samples, SAMPLE_RATE).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(wav.to_vec())).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, SAMPLE_RATE as u32);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![16383, -16383, 32767, -32767, 32767, -32767]);
    }

    #[test]
    fn test_encode_empty_rejected() {
        assert!(matches!(encode_wav(&[], SAMPLE_RATE), Err(WavError::EmptyAudio)));
    }

    #[test]
    fn test_encode_zero_rate_rejected() {
        assert!(matches!(
            encode_wav(&[0.1], 0),
            Err(WavError::InvalidSampleRate(0))
        ));
    }
}
