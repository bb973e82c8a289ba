//! Conversion between in-memory float samples and wire audio.
//!
//! Wire audio is base64 text wrapping signed 16-bit little-endian PCM. The
//! live session sends microphone audio as mono 16 kHz and receives model
//! speech as mono 24 kHz.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;
use thiserror::Error;

/// Bytes per encoded sample (16-bit PCM)
pub const SAMPLE_BYTES: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Base64 decode error: {0}")]
    Base64(String),

    #[error("Payload length {0} is not a multiple of {SAMPLE_BYTES} bytes")]
    OddLength(usize),

    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),
}

/// Decoded audio ready to be scheduled for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved samples in [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Map one float sample to 16-bit PCM. Out-of-range values saturate,
/// infinities go to the matching bound and NaN becomes silence.
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32768.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert f32 samples to PCM 16-bit little-endian bytes
pub fn samples_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut pcm_data = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for &sample in samples {
        pcm_data.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    pcm_data
}

/// Convert PCM 16-bit little-endian bytes back to f32 samples
pub fn pcm_to_samples(pcm: &[u8]) -> Result<Vec<f32>, CodecError> {
    if pcm.len() % SAMPLE_BYTES != 0 {
        return Err(CodecError::OddLength(pcm.len()));
    }
    Ok(pcm
        .chunks_exact(SAMPLE_BYTES)
        .map(|bytes| i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode a captured frame into its wire representation.
pub fn encode_frame(samples: &[f32]) -> String {
    STANDARD.encode(samples_to_pcm(samples))
}

/// Decode wire audio into a playable buffer tagged with `sample_rate` and `channels`.
pub fn decode_wire_audio(
    wire: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, CodecError> {
    if sample_rate == 0 || channels == 0 {
        return Err(CodecError::InvalidFormat(format!(
            "{} Hz, {} channels",
            sample_rate, channels
        )));
    }

    let pcm = STANDARD
        .decode(wire.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    let samples = pcm_to_samples(&pcm)?;

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f32 = 1.0 / 32768.0;

    #[test]
    fn test_round_trip_within_one_step() {
        let samples: Vec<f32> = (0..=200).map(|i| (i as f32 - 100.0) / 100.0).collect();

        let wire = encode_frame(&samples);
        let buffer = decode_wire_audio(&wire, 16000, 1).unwrap();

        assert_eq!(buffer.samples.len(), samples.len());
        for (original, decoded) in samples.iter().zip(&buffer.samples) {
            assert!(
                (original - decoded).abs() <= STEP,
                "{} decoded as {}",
                original,
                decoded
            );
        }
    }

    #[test]
    fn test_single_sample_round_trip() {
        let buffer = decode_wire_audio(&encode_frame(&[0.25]), 24000, 1).unwrap();
        assert!((buffer.samples[0] - 0.25).abs() <= STEP);
    }

    #[test]
    fn test_out_of_range_clamps_instead_of_wrapping() {
        assert_eq!(encode_frame(&[1.5, -2.0]), encode_frame(&[1.0, -1.0]));

        let pcm = samples_to_pcm(&[1.5, -2.0]);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), i16::MIN);
    }

    #[test]
    fn test_non_finite_input_does_not_propagate() {
        let pcm = samples_to_pcm(&[f32::INFINITY, f32::NEG_INFINITY, f32::NAN]);
        let decoded = pcm_to_samples(&pcm).unwrap();

        assert_eq!(decoded[0], i16::MAX as f32 / 32768.0);
        assert_eq!(decoded[1], -1.0);
        assert_eq!(decoded[2], 0.0);
    }

    #[test]
    fn test_odd_length_payload_is_rejected() {
        let wire = STANDARD.encode([0u8, 1, 2]);
        assert_eq!(
            decode_wire_audio(&wire, 24000, 1),
            Err(CodecError::OddLength(3))
        );
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(matches!(
            decode_wire_audio("not base64!!", 24000, 1),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 12000], 24000, 1);
        assert!((buffer.duration_secs() - 0.5).abs() < 1e-9);

        let stereo = AudioBuffer::new(vec![0.0; 48000], 24000, 2);
        assert_eq!(stereo.frames(), 24000);
        assert!((stereo.duration_secs() - 1.0).abs() < 1e-9);
    }
}
