//! CPAL audio output
//!
//! Brings up the single output stream whose callback owns the
//! [`PlaybackEngine`] exclusively:
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control thread  │───push()───────────►│   Command Queue     │
//! │  (Player)        │                     │  (lock-free SPSC)   │
//! └──────────────────┘                     └──────────┬──────────┘
//!                                                     │ pop()
//!                                                     ▼
//!                                          ┌─────────────────────┐
//!                                          │  CPAL Audio Thread  │
//!                                          │ (owns PlaybackEngine)│
//!                                          └─────────────────────┘
//! ```
//!
//! The callback never locks: commands arrive over the ring, the active
//! source pulls from decoder or worker ring, and the mix stage runs in
//! place on a pre-allocated buffer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};
use thiserror::Error;

use chipdeck_core::StereoBuffer;

use crate::command::{command_channel, CommandSender};
use crate::config::{EngineConfig, MAX_BUFFER_SIZE};
use crate::engine::PlaybackEngine;

/// Errors bringing up the audio device
#[derive(Error, Debug)]
pub enum AudioError {
    /// No default output device available
    #[error("no default audio output device")]
    NoDefaultDevice,

    /// Failed to get device configuration
    #[error("failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start stream
    #[error("failed to start audio stream: {0}")]
    StreamPlayError(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

/// Handle to the running audio system. Drop it to stop audio.
pub struct AudioHandle {
    _stream: Stream,
    sample_rate: u32,
    buffer_size: u32,
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Everything the control thread needs after startup
pub struct AudioSystemResult {
    /// Keeps the stream alive (drop to stop)
    pub handle: AudioHandle,
    /// Command sender to hand to the [`crate::player::Player`]
    pub command_sender: CommandSender,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub latency_ms: f32,
}

/// Start the audio system on the default output device
pub fn start_audio_system(config: &EngineConfig) -> AudioResult<AudioSystemResult> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoDefaultDevice)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let (stream_config, buffer_size) = get_output_config(&device, config)?;
    let sample_rate = stream_config.sample_rate.0;
    let latency_ms = (buffer_size as f32 / sample_rate as f32) * 1000.0;

    log::info!(
        "Audio config: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        stream_config.channels,
        sample_rate,
        buffer_size,
        latency_ms
    );

    let (command_sender, mut command_rx) = command_channel();
    let mut engine = PlaybackEngine::new();
    let mut buffer = StereoBuffer::silence(MAX_BUFFER_SIZE);
    let channels = stream_config.channels as usize;

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let n_frames = data.len() / channels;
                // RT-safe: working length only, no allocation
                buffer.set_len_from_capacity(n_frames.min(MAX_BUFFER_SIZE));

                engine.process_commands(&mut command_rx);
                engine.process(&mut buffer);

                let samples = buffer.as_slice();
                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    if i < samples.len() {
                        let sample = samples[i];
                        frame[0] = sample.left;
                        if channels > 1 {
                            frame[1] = sample.right;
                        }
                        for ch in frame.iter_mut().skip(2) {
                            *ch = 0.0;
                        }
                    } else {
                        for ch in frame.iter_mut() {
                            *ch = 0.0;
                        }
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
    log::info!("Audio stream started");

    Ok(AudioSystemResult {
        handle: AudioHandle {
            _stream: stream,
            sample_rate,
            buffer_size,
        },
        command_sender,
        sample_rate,
        buffer_size,
        latency_ms,
    })
}

/// Pick the best f32 stereo output configuration for the device
fn get_output_config(
    device: &cpal::Device,
    config: &EngineConfig,
) -> AudioResult<(StreamConfig, u32)> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    if supported_configs.is_empty() {
        return Err(AudioError::ConfigError(
            "no supported output configurations".to_string(),
        ));
    }

    let target_sample_rate = config.target_sample_rate();

    let best_config = supported_configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(|c| {
            target_sample_rate >= c.min_sample_rate().0
                && target_sample_rate <= c.max_sample_rate().0
        })
        .or_else(|| supported_configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported_configs.first())
        .ok_or_else(|| AudioError::ConfigError("no suitable output configuration".to_string()))?;

    let sample_rate = if target_sample_rate >= best_config.min_sample_rate().0
        && target_sample_rate <= best_config.max_sample_rate().0
    {
        cpal::SampleRate(target_sample_rate)
    } else {
        let fallback = best_config.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz",
            target_sample_rate,
            fallback.0
        );
        fallback
    };

    let buffer_size = config.buffer_size.as_frames();
    let stream_config = StreamConfig {
        channels: best_config.channels().min(2),
        sample_rate,
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };

    Ok((stream_config, buffer_size))
}
