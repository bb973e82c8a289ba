use super::{AudioOutput, ChunkId, PlaybackError};
use crate::audio_codec::AudioBuffer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, sync_channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct CpalOutputConfig {
    /// Output device name (None = default device)
    pub device_name: Option<String>,
}

/// A chunk already resampled to the device rate, waiting for its start frame.
struct Voice {
    id: ChunkId,
    samples: Vec<f32>,
    start_frame: u64,
    ended: mpsc::UnboundedSender<ChunkId>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct Mixer {
    voices: Vec<Voice>,
}

/// End of the most recently scheduled voice, in seconds and device frames.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tail {
    id: ChunkId,
    end_time: f64,
    end_frame: u64,
}

/// Device frame at which a voice queued for `start_at` begins.
///
/// A voice queued at the end time of the previous one starts on that voice's
/// end frame. Rounding each start and each resampled length separately
/// would leave a one-frame gap or overlap at non-integer rate ratios.
fn start_frame_for(start_at: f64, device_rate: u32, tail: Option<Tail>) -> u64 {
    let half_frame = 0.5 / device_rate as f64;
    match tail {
        Some(tail) if (start_at - tail.end_time).abs() < half_frame => tail.end_frame,
        _ => (start_at * device_rate as f64).round() as u64,
    }
}

enum OutputCommand {
    Shutdown,
}

/// Sample-clock mixer on top of a cpal output stream.
///
/// The clock is the number of frames handed to the device. Each scheduled
/// voice starts at its exact frame, so back-to-back chunks join seamlessly.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    frames_played: Arc<AtomicU64>,
    is_closed: Arc<AtomicBool>,
    device_rate: u32,
    tail: Option<Tail>,
    command_tx: Sender<OutputCommand>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new(config: CpalOutputConfig) -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        log::debug!("AudioOutput: Using audio host: {:?}", host.id());

        let device = find_output_device(&host, &config)?;
        let supported_config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        log::debug!("AudioOutput: Using output config: {:?}", supported_config);

        let sample_format = supported_config.sample_format();
        let stream_config = supported_config.config();
        let device_rate = stream_config.sample_rate.0;

        let mixer = Arc::new(Mutex::new(Mixer { voices: Vec::new() }));
        let frames_played = Arc::new(AtomicU64::new(0));
        let is_closed = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = channel();
        let (ready_tx, ready_rx) = sync_channel::<Result<(), PlaybackError>>(1);

        let thread_mixer = Arc::clone(&mixer);
        let thread_frames = Arc::clone(&frames_played);
        let thread_closed = Arc::clone(&is_closed);

        // The cpal stream is not Send, so it lives on its own thread.
        let audio_thread = thread::spawn(move || {
            let stream = match sample_format {
                SampleFormat::F32 => build_stream::<f32>(
                    &device,
                    &stream_config,
                    thread_mixer,
                    thread_frames,
                    Arc::clone(&thread_closed),
                ),
                SampleFormat::I16 => build_stream::<i16>(
                    &device,
                    &stream_config,
                    thread_mixer,
                    thread_frames,
                    Arc::clone(&thread_closed),
                ),
                SampleFormat::U16 => build_stream::<u16>(
                    &device,
                    &stream_config,
                    thread_mixer,
                    thread_frames,
                    Arc::clone(&thread_closed),
                ),
                other => Err(PlaybackError::Device(format!(
                    "Unsupported sample format: {:?}",
                    other
                ))),
            };

            let stream = match stream.and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| PlaybackError::Stream(e.to_string()))?;
                Ok(stream)
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    log::error!("AudioOutput: Failed to start output stream: {}", e);
                    thread_closed.store(true, Ordering::Release);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            log::debug!("AudioOutput: Output stream started");

            while let Ok(command) = command_rx.recv() {
                match command {
                    OutputCommand::Shutdown => break,
                }
            }

            thread_closed.store(true, Ordering::Release);
            drop(stream);
            log::debug!("AudioOutput: Audio thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(PlaybackError::Stream(
                    "Audio thread exited before starting".to_string(),
                ))
            }
        }

        log::info!("🔊 Audio output ready at {} Hz", device_rate);

        Ok(Self {
            mixer,
            frames_played,
            is_closed,
            device_rate,
            tail: None,
            command_tx,
            audio_thread: Some(audio_thread),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }
}

impl AudioOutput for CpalOutput {
    fn now(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(
        &mut self,
        id: ChunkId,
        buffer: AudioBuffer,
        start_at: f64,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<(), PlaybackError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(PlaybackError::OutputClosed);
        }

        let samples = resample_to_mono(&buffer, self.device_rate);
        let start_frame = start_frame_for(start_at, self.device_rate, self.tail);
        let tail = Tail {
            id,
            end_time: start_at + buffer.duration_secs(),
            end_frame: start_frame + samples.len() as u64,
        };

        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| PlaybackError::Stream("Mixer lock poisoned".to_string()))?;
        mixer.voices.push(Voice {
            id,
            samples,
            start_frame,
            ended,
        });
        self.tail = Some(tail);
        Ok(())
    }

    fn stop(&mut self, id: ChunkId) {
        if self.tail.map(|tail| tail.id) == Some(id) {
            self.tail = None;
        }
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.retain(|voice| voice.id != id);
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.command_tx.send(OutputCommand::Shutdown);
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("AudioOutput: Failed to join audio thread: {:?}", e);
            }
        }
    }
}

fn find_output_device(host: &cpal::Host, config: &CpalOutputConfig) -> Result<Device, PlaybackError> {
    match &config.device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| PlaybackError::Device(format!("Failed to enumerate devices: {}", e)))?
            .find(|device| device.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| PlaybackError::Device(format!("Output device '{}' not found", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("No output device found".to_string())),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    frames_played: Arc<AtomicU64>,
    is_closed: Arc<AtomicBool>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let clock = frames_played.load(Ordering::Acquire);

                let Ok(mut mixer) = mixer.try_lock() else {
                    // Scheduler holds the lock: play silence, keep the clock moving.
                    data.fill(T::from_sample(0.0f32));
                    frames_played.store(clock + frames as u64, Ordering::Release);
                    return;
                };

                mix_into(&mixer.voices, clock, frames, channels, data);

                let window_end = clock + frames as u64;
                mixer.voices.retain(|voice| {
                    if voice.end_frame() <= window_end {
                        let _ = voice.ended.send(voice.id);
                        false
                    } else {
                        true
                    }
                });

                frames_played.store(window_end, Ordering::Release);
            },
            move |err| {
                log::error!("AudioOutput: Stream error: {}", err);
                is_closed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| PlaybackError::Stream(e.to_string()))
}

/// Sum every voice overlapping `[clock, clock + frames)` into `data`.
fn mix_into<T>(voices: &[Voice], clock: u64, frames: usize, channels: usize, data: &mut [T])
where
    T: SizedSample + FromSample<f32>,
{
    for (i, frame) in data.chunks_mut(channels).take(frames).enumerate() {
        let position = clock + i as u64;
        let mut value = 0.0f32;
        for voice in voices {
            if position >= voice.start_frame && position < voice.end_frame() {
                value += voice.samples[(position - voice.start_frame) as usize];
            }
        }
        let sample = T::from_sample(value.clamp(-1.0, 1.0));
        for channel in frame.iter_mut() {
            *channel = sample;
        }
    }
}

/// Downmix to mono and linearly resample to `target_rate`.
fn resample_to_mono(buffer: &AudioBuffer, target_rate: u32) -> Vec<f32> {
    let channels = buffer.channels.max(1) as usize;
    let mono: Vec<f32> = buffer
        .samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    if buffer.sample_rate == target_rate || mono.is_empty() {
        return mono;
    }

    let ratio = buffer.sample_rate as f64 / target_rate as f64;
    let output_len = (mono.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src = i as f64 * ratio;
        let floor = src.floor() as usize;
        let ceil = (floor + 1).min(mono.len() - 1);
        let fract = (src - floor as f64) as f32;
        let a = mono[floor.min(mono.len() - 1)];
        let b = mono[ceil];
        output.push(a * (1.0 - fract) + b * fract);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_keeps_duration() {
        let buffer = AudioBuffer::new(vec![0.5; 24000], 24000, 1);
        let resampled = resample_to_mono(&buffer, 48000);
        assert_eq!(resampled.len(), 48000);
        assert!(resampled.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_resample_downmixes_stereo() {
        let buffer = AudioBuffer::new(vec![1.0, 0.0, 1.0, 0.0], 16000, 2);
        assert_eq!(resample_to_mono(&buffer, 16000), vec![0.5, 0.5]);
    }

    #[test]
    fn test_mix_starts_voice_at_exact_frame() {
        let (ended, _rx) = mpsc::unbounded_channel();
        let voices = vec![Voice {
            id: ChunkId(0),
            samples: vec![0.25; 4],
            start_frame: 2,
            ended,
        }];

        let mut data = vec![0.0f32; 8];
        mix_into(&voices, 0, 8, 1, &mut data);

        assert_eq!(data, vec![0.0, 0.0, 0.25, 0.25, 0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_back_to_back_voices_share_frame_boundaries() {
        // 1001 samples at 24 kHz resample to 1839 frames at 44.1 kHz, while
        // the third chunk's nominal start rounds to frame 3679.
        let device_rate = 44100;
        let chunk = AudioBuffer::new(vec![0.1; 1001], 24000, 1);

        let mut tail = None;
        let mut start_at = 0.0;
        let mut starts = Vec::new();
        for i in 0..3 {
            let frames = resample_to_mono(&chunk, device_rate).len() as u64;
            assert_eq!(frames, 1839);

            let start_frame = start_frame_for(start_at, device_rate, tail);
            starts.push(start_frame);
            tail = Some(Tail {
                id: ChunkId(i),
                end_time: start_at + chunk.duration_secs(),
                end_frame: start_frame + frames,
            });
            start_at += chunk.duration_secs();
        }

        let nominal = ((start_at - chunk.duration_secs()) * device_rate as f64).round() as u64;
        assert_eq!(nominal, 3679);
        assert_eq!(starts, vec![0, 1839, 3678]);
    }

    #[test]
    fn test_voice_after_a_gap_uses_its_own_time() {
        let tail = Some(Tail {
            id: ChunkId(0),
            end_time: 0.5,
            end_frame: 24001,
        });
        assert_eq!(start_frame_for(2.0, 48000, tail), 96000);
        assert_eq!(start_frame_for(0.5, 48000, tail), 24001);
        assert_eq!(start_frame_for(0.5, 48000, None), 24000);
    }

    #[cfg(feature = "test-audio")]
    #[test]
    fn test_cpal_output_creation() {
        match CpalOutput::new(CpalOutputConfig::default()) {
            Ok(output) => assert!(output.device_rate() > 0),
            Err(e) => log::warn!("Audio device not available in test environment: {}", e),
        }
    }
}
