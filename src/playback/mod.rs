//! Gapless scheduling of model speech.
//!
//! Chunks arrive from the network with arbitrary jitter. Each one is pinned
//! to the end of the previous chunk on the output clock (or to "now" when the
//! queue has drained), so speech plays back-to-back without gaps or overlap.

pub mod cpal_output;

use crate::audio_codec::AudioBuffer;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use cpal_output::{CpalOutput, CpalOutputConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Audio output is closed")]
    OutputClosed,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Identifies one scheduled chunk for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Output device seen through its clock.
///
/// `schedule` must start `buffer` exactly at `start_at` seconds on the output
/// clock and send `id` on `ended` once the last sample has been played.
/// Stopped chunks must not report an end.
pub trait AudioOutput: Send {
    /// Current output clock in seconds
    fn now(&self) -> f64;

    fn schedule(
        &mut self,
        id: ChunkId,
        buffer: AudioBuffer,
        start_at: f64,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<(), PlaybackError>;

    fn stop(&mut self, id: ChunkId);
}

/// A chunk that is scheduled and has not finished playing yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackChunk {
    pub id: ChunkId,
    pub scheduled_start_time: f64,
    pub duration: f64,
}

impl PlaybackChunk {
    pub fn end_time(&self) -> f64 {
        self.scheduled_start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    /// 0.0 means unset
    next_start_time: f64,
    in_flight: BTreeMap<ChunkId, PlaybackChunk>,
    next_id: u64,
    ended_tx: mpsc::UnboundedSender<ChunkId>,
}

impl PlaybackScheduler {
    /// Create a scheduler and the receiver on which playback-end events arrive.
    pub fn new(output: Box<dyn AudioOutput>) -> (Self, mpsc::UnboundedReceiver<ChunkId>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        (
            Self {
                output,
                next_start_time: 0.0,
                in_flight: BTreeMap::new(),
                next_id: 0,
                ended_tx,
            },
            ended_rx,
        )
    }

    /// Current output clock
    pub fn output_now(&self) -> f64 {
        self.output.now()
    }

    /// Schedule `buffer` no earlier than `now` and no earlier than the end of
    /// the previously scheduled chunk.
    pub fn enqueue(&mut self, buffer: AudioBuffer, now: f64) -> Result<PlaybackChunk, PlaybackError> {
        let start_at = self.next_start_time.max(now);
        let duration = buffer.duration_secs();
        let id = ChunkId(self.next_id);

        self.output
            .schedule(id, buffer, start_at, self.ended_tx.clone())?;

        self.next_id += 1;
        self.next_start_time = start_at + duration;

        let chunk = PlaybackChunk {
            id,
            scheduled_start_time: start_at,
            duration,
        };
        self.in_flight.insert(id, chunk);

        log::trace!(
            "Playback: scheduled {} at {:.3}s for {:.3}s ({} in flight)",
            id,
            start_at,
            duration,
            self.in_flight.len()
        );

        Ok(chunk)
    }

    /// Schedule against the output's own clock.
    pub fn enqueue_now(&mut self, buffer: AudioBuffer) -> Result<PlaybackChunk, PlaybackError> {
        let now = self.output.now();
        self.enqueue(buffer, now)
    }

    /// Record the end of a chunk. Returns true when this end drained the
    /// in-flight set. Ends of chunks that were already flushed are ignored.
    pub fn on_chunk_ended(&mut self, id: ChunkId) -> bool {
        if self.in_flight.remove(&id).is_none() {
            log::trace!("Playback: ignoring end of unknown {}", id);
            return false;
        }
        log::trace!(
            "Playback: {} finished ({} in flight)",
            id,
            self.in_flight.len()
        );
        self.in_flight.is_empty()
    }

    /// Stop everything immediately and forget the cursor.
    pub fn flush(&mut self) {
        if !self.in_flight.is_empty() {
            log::debug!("Playback: flushing {} chunks", self.in_flight.len());
        }
        for id in std::mem::take(&mut self.in_flight).into_keys() {
            self.output.stop(id);
        }
        self.next_start_time = 0.0;
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &PlaybackChunk> {
        self.in_flight.values()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Output double with a manually driven clock.
    #[derive(Default)]
    pub struct ManualOutput {
        pub clock: Arc<Mutex<f64>>,
        pub scheduled: Arc<Mutex<Vec<(ChunkId, f64)>>>,
        pub stopped: Arc<Mutex<Vec<ChunkId>>>,
        pub closed: bool,
    }

    impl AudioOutput for ManualOutput {
        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn schedule(
            &mut self,
            id: ChunkId,
            _buffer: AudioBuffer,
            start_at: f64,
            _ended: mpsc::UnboundedSender<ChunkId>,
        ) -> Result<(), PlaybackError> {
            if self.closed {
                return Err(PlaybackError::OutputClosed);
            }
            self.scheduled.lock().unwrap().push((id, start_at));
            Ok(())
        }

        fn stop(&mut self, id: ChunkId) {
            self.stopped.lock().unwrap().push(id);
        }
    }

    fn seconds(secs: f64) -> AudioBuffer {
        AudioBuffer::new(vec![0.0; (secs * 1000.0) as usize], 1000, 1)
    }

    #[test]
    fn test_chunks_play_back_to_back_despite_jitter() {
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(ManualOutput::default()));

        let starts: Vec<f64> = [(1.0, 0.0), (0.5, 0.3), (2.0, 0.4)]
            .into_iter()
            .map(|(duration, arrival)| {
                scheduler
                    .enqueue(seconds(duration), arrival)
                    .unwrap()
                    .scheduled_start_time
            })
            .collect();

        assert_eq!(starts, vec![0.0, 1.0, 1.5]);
        assert_eq!(scheduler.next_start_time(), 3.5);
        assert_eq!(scheduler.in_flight_len(), 3);
    }

    #[test]
    fn test_late_arrival_starts_now() {
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(ManualOutput::default()));

        scheduler.enqueue(seconds(0.5), 0.0).unwrap();
        let chunk = scheduler.enqueue(seconds(0.5), 2.0).unwrap();

        assert_eq!(chunk.scheduled_start_time, 2.0);
        assert_eq!(chunk.end_time(), 2.5);
    }

    #[test]
    fn test_flush_clears_and_resets_cursor() {
        let output = ManualOutput::default();
        let stopped = Arc::clone(&output.stopped);
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(output));

        let first = scheduler.enqueue(seconds(1.0), 0.0).unwrap();
        let second = scheduler.enqueue(seconds(1.0), 0.0).unwrap();
        scheduler.flush();

        assert!(!scheduler.has_in_flight());
        assert_eq!(*stopped.lock().unwrap(), vec![first.id, second.id]);

        let next = scheduler.enqueue(seconds(1.0), 0.7).unwrap();
        assert_eq!(next.scheduled_start_time, 0.7);

        // Idempotent
        scheduler.flush();
        scheduler.flush();
        assert!(!scheduler.has_in_flight());
    }

    #[test]
    fn test_drain_is_reported_once_set_empties() {
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(ManualOutput::default()));

        let a = scheduler.enqueue(seconds(0.2), 0.0).unwrap();
        let b = scheduler.enqueue(seconds(0.2), 0.0).unwrap();

        assert!(!scheduler.on_chunk_ended(a.id));
        assert!(scheduler.on_chunk_ended(b.id));
        // A late duplicate does not drain twice
        assert!(!scheduler.on_chunk_ended(b.id));
    }

    #[test]
    fn test_ends_of_flushed_chunks_are_ignored() {
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(ManualOutput::default()));

        let stale = scheduler.enqueue(seconds(0.2), 0.0).unwrap();
        scheduler.flush();
        let fresh = scheduler.enqueue(seconds(0.2), 0.0).unwrap();

        assert!(!scheduler.on_chunk_ended(stale.id));
        assert!(scheduler.has_in_flight());
        assert!(scheduler.on_chunk_ended(fresh.id));
    }

    #[test]
    fn test_closed_output_reports_error_and_keeps_cursor() {
        let output = ManualOutput {
            closed: true,
            ..Default::default()
        };
        let (mut scheduler, _rx) = PlaybackScheduler::new(Box::new(output));

        assert_eq!(
            scheduler.enqueue(seconds(1.0), 0.0),
            Err(PlaybackError::OutputClosed)
        );
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert!(!scheduler.has_in_flight());
    }
}
