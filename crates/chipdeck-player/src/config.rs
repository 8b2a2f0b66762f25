//! Engine configuration
//!
//! Output and timing settings for the playback engine. Serializable so an
//! embedding application can persist them alongside its own settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default output sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default device buffer size when no preference is specified (frames).
/// 512 frames is a safe default that works on most systems.
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Maximum buffer size to pre-allocate for real-time safety.
/// Pre-allocating to this size eliminates allocations in the audio callback.
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Ceiling on waits for worker/runtime readiness and load acknowledgments.
/// Initialization that exceeds this fails over to the next backend kind
/// rather than hanging.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 10_000;

/// Preferred device buffer size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferSize {
    /// Let the system choose the default buffer size
    #[default]
    Default,
    /// Request a specific buffer size in frames (may be adjusted by the system)
    Fixed(u32),
}

impl BufferSize {
    /// Resolve to a concrete frame count, clamped to the pre-allocated range
    pub fn as_frames(&self) -> u32 {
        match self {
            BufferSize::Default => DEFAULT_BUFFER_SIZE,
            BufferSize::Fixed(frames) => (*frames).clamp(64, MAX_BUFFER_SIZE as u32),
        }
    }
}

/// Configuration for the playback engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Preferred sample rate (None = use device default)
    pub sample_rate: Option<u32>,

    /// Preferred device buffer size
    pub buffer_size: BufferSize,

    /// Bound on worker readiness / load-acknowledgment waits, in
    /// milliseconds
    pub init_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            buffer_size: BufferSize::default(),
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    /// Set the preferred sample rate
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// Set a fixed device buffer size in frames
    pub fn with_buffer_frames(mut self, frames: u32) -> Self {
        self.buffer_size = BufferSize::Fixed(frames);
        self
    }

    /// Set the worker readiness/load timeout
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The configured timeout as a `Duration`
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// The sample rate to request from the device
    pub fn target_sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_resolution() {
        assert_eq!(BufferSize::Default.as_frames(), DEFAULT_BUFFER_SIZE);
        assert_eq!(BufferSize::Fixed(1024).as_frames(), 1024);
        assert_eq!(BufferSize::Fixed(1).as_frames(), 64);
        assert_eq!(BufferSize::Fixed(1 << 20).as_frames(), MAX_BUFFER_SIZE as u32);
    }

    #[test]
    fn test_config_builders() {
        let config = EngineConfig::default()
            .with_sample_rate(48_000)
            .with_buffer_frames(256)
            .with_init_timeout(Duration::from_secs(2));
        assert_eq!(config.target_sample_rate(), 48_000);
        assert_eq!(config.buffer_size.as_frames(), 256);
        assert_eq!(config.init_timeout(), Duration::from_secs(2));
    }
}
