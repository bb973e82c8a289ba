use super::{CaptureError, CaptureSource, ChunkAccumulator, DEFAULT_CHUNK_SIZE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    SupportedStreamConfig,
};
use std::sync::mpsc::{channel, sync_channel, Sender};
use std::thread;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    /// Input device name (None = default device)
    pub device_name: Option<String>,
    /// Rate of the delivered frames
    pub sample_rate: u32,
    /// Samples per delivered frame
    pub chunk_size: usize,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16000,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

enum CaptureCommand {
    Shutdown,
}

struct ActiveCapture {
    command_tx: Sender<CaptureCommand>,
    thread: thread::JoinHandle<()>,
}

/// cpal microphone. The stream lives on a dedicated thread for as long as
/// capture is active.
pub struct MicrophoneCapture {
    config: MicrophoneConfig,
    active: Option<ActiveCapture>,
}

impl MicrophoneCapture {
    pub fn new(config: MicrophoneConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    fn find_device(&self) -> Result<Device, CaptureError> {
        let host = cpal::default_host();
        match &self.config.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| CaptureError::Device(format!("Failed to enumerate devices: {}", e)))?
                .find(|dev| dev.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| {
                    CaptureError::PermissionDenied(format!("Microphone '{}' not found", name))
                }),
            None => host.default_input_device().ok_or_else(|| {
                CaptureError::PermissionDenied("No microphone available".to_string())
            }),
        }
    }
}

impl CaptureSource for MicrophoneCapture {
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Ok(());
        }

        let device = self.find_device()?;
        let supported = find_best_config(&device, self.config.sample_rate)?;
        let sample_format = supported.sample_format();
        let stream_config = supported.config();
        let target_rate = self.config.sample_rate;
        let chunk_size = self.config.chunk_size;

        log::info!(
            "🎤 Capturing {:?}, {} channels @ {} Hz (delivering {} Hz frames of {})",
            sample_format,
            stream_config.channels,
            stream_config.sample_rate.0,
            target_rate,
            chunk_size
        );

        let (command_tx, command_rx) = channel();
        let (ready_tx, ready_rx) = sync_channel::<Result<(), CaptureError>>(1);

        let thread = thread::spawn(move || {
            let stream = match sample_format {
                SampleFormat::I16 => {
                    build_stream::<i16>(&device, &stream_config, target_rate, chunk_size, frames)
                }
                SampleFormat::U16 => {
                    build_stream::<u16>(&device, &stream_config, target_rate, chunk_size, frames)
                }
                SampleFormat::F32 => {
                    build_stream::<f32>(&device, &stream_config, target_rate, chunk_size, frames)
                }
                other => Err(CaptureError::Config(format!(
                    "Unsupported format: {:?}",
                    other
                ))),
            };

            let stream = match stream.and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| CaptureError::Stream(format!("Failed to start stream: {}", e)))?;
                Ok(stream)
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while let Ok(command) = command_rx.recv() {
                match command {
                    CaptureCommand::Shutdown => break,
                }
            }

            drop(stream);
            log::debug!("Capture: microphone released");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.active = Some(ActiveCapture { command_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::Stream(
                "Capture thread exited before starting".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.command_tx.send(CaptureCommand::Shutdown);
            if let Err(e) = active.thread.join() {
                log::error!("Capture: failed to join capture thread: {:?}", e);
            }
            log::info!("🎤 Microphone stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Prefer a config that natively supports the target rate, then 48 kHz,
/// then 44.1 kHz.
fn find_best_config(device: &Device, target_rate: u32) -> Result<SupportedStreamConfig, CaptureError> {
    let supported_configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Device(format!("Failed to get configs: {}", e)))?;

    let mut best: Option<(i32, SupportedStreamConfig)> = None;

    for supported in supported_configs {
        let min_rate = supported.min_sample_rate().0;
        let max_rate = supported.max_sample_rate().0;

        let (mut score, rate) = if min_rate <= target_rate && max_rate >= target_rate {
            (1000, target_rate)
        } else if min_rate <= 48000 && max_rate >= 48000 {
            (500, 48000)
        } else if min_rate <= 44100 && max_rate >= 44100 {
            (400, 44100)
        } else {
            continue;
        };

        score += match supported.sample_format() {
            SampleFormat::F32 => 50,
            SampleFormat::I16 => 25,
            _ => 0,
        };
        if supported.channels() == 1 {
            score += 10;
        }

        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, supported.with_sample_rate(cpal::SampleRate(rate))));
        }
    }

    match best {
        Some((_, config)) => Ok(config),
        None => device
            .default_input_config()
            .map_err(|e| CaptureError::Config(e.to_string())),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    chunk_size: usize,
    frames: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    let mut accumulator = ChunkAccumulator::new(chunk_size);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>()
                            / frame.len() as f32
                    })
                    .collect();

                let samples = resample_linear(&mono, device_rate, target_rate);
                for chunk in accumulator.push(&samples) {
                    // Consumer gone means the session is tearing down.
                    if frames.send(chunk).is_err() {
                        return;
                    }
                }
            },
            |err| log::error!("Capture: stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => {
                CaptureError::PermissionDenied("Microphone is not available".to_string())
            }
            other => CaptureError::Stream(format!("Failed to build stream: {}", other)),
        })
}

fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    (0..output_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let floor = (src.floor() as usize).min(samples.len() - 1);
            let ceil = (floor + 1).min(samples.len() - 1);
            let fract = (src - floor as f64) as f32;
            samples[floor] * (1.0 - fract) + samples[ceil] * fract
        })
        .collect()
}
