//! Microphone capture delivering fixed-size mono frames.

pub mod cpal_input;

use thiserror::Error;
use tokio::sync::mpsc;

pub use cpal_input::{MicrophoneCapture, MicrophoneConfig};

/// Samples per delivered frame (256 ms at 16 kHz)
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Microphone unavailable: {0}")]
    PermissionDenied(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A microphone that hands fixed-size frames to a consumer while active.
///
/// `stop` must be idempotent and safe to call when `start` never succeeded.
pub trait CaptureSource: Send {
    /// Begin capturing; every complete frame is sent on `frames`.
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Re-blocks arbitrary callback buffers into frames of exactly `chunk_size` samples.
#[derive(Debug, Clone)]
pub struct ChunkAccumulator {
    chunk_size: usize,
    pending: Vec<f32>,
}

impl ChunkAccumulator {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
        }
    }

    /// Append samples and return every frame that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut complete = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.chunk_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.chunk_size {
                complete.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.chunk_size),
                ));
            }
        }

        complete
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_emits_exact_frames() {
        let mut acc = ChunkAccumulator::new(4);

        assert!(acc.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(acc.pending(), 3);

        let frames = acc.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(
            frames,
            vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]
        );
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_accumulator_preserves_order_across_many_pushes() {
        let mut acc = ChunkAccumulator::new(DEFAULT_CHUNK_SIZE);
        let mut frames = Vec::new();
        for block in 0..20 {
            let samples: Vec<f32> = (0..1000).map(|i| (block * 1000 + i) as f32).collect();
            frames.extend(acc.push(&samples));
        }

        assert_eq!(frames.len(), 20_000 / DEFAULT_CHUNK_SIZE);
        let flat: Vec<f32> = frames.into_iter().flatten().collect();
        assert!(flat.iter().enumerate().all(|(i, s)| *s == i as f32));
    }

    #[test]
    fn test_clear_drops_partial_frame() {
        let mut acc = ChunkAccumulator::new(2);
        acc.push(&[1.0]);
        acc.clear();
        assert_eq!(acc.push(&[2.0, 3.0]), vec![vec![2.0, 3.0]]);
    }
}
