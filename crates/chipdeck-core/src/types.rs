//! Common types for Chipdeck
//!
//! This module contains the fundamental audio and playback types used
//! throughout the Chipdeck engine, including stereo buffer handling and the
//! playback-position report shared between backends and the UI.

use std::ops::{Index, IndexMut};

/// Maximum number of channels for which per-channel VU levels are tracked.
/// Matches the fixed VU array in the shared position record.
pub const MAX_VU_CHANNELS: usize = 32;

/// Audio sample type (32-bit float throughout the engine)
pub type Sample = f32;

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck, avoiding per-frame format conversions
/// when handing buffers to the audio device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Scale both channels by a factor
    #[inline]
    pub fn scale(&self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }

    /// Get the peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo samples
///
/// The primary audio buffer type used throughout Chipdeck. Backends fill it
/// with raw stereo frames and the mix stage processes it in place.
#[derive(Debug, Clone)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Get the number of stereo frames in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Panics in debug builds if new_len > capacity. Use for pre-allocated
    /// buffers only; fills any newly exposed frames with silence.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    /// Fill the buffer with silence
    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    /// Get a slice of the frames
    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    /// Get a mutable slice of the frames
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Get a zero-copy view of frames as interleaved f32 [L, R, L, R, ...]
    ///
    /// This is a zero-cost operation thanks to `#[repr(C)]` on StereoSample.
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Get a zero-copy mutable view of frames as interleaved f32
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Scale all frames by a factor
    pub fn scale(&mut self, factor: Sample) {
        for sample in &mut self.samples {
            *sample *= factor;
        }
    }

    /// Get the peak amplitude in the buffer
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

impl Default for StereoBuffer {
    fn default() -> Self {
        Self { samples: Vec::new() }
    }
}

/// One position report produced by a backend
///
/// `report_clock` records the backend-clock timestamp (seconds) at which the
/// report was captured; the position synchronizer uses it to extrapolate
/// display time between reports. Both fields must come from the same clock
/// domain as the backend's `clock_seconds()`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackPosition {
    /// Index into the module's play sequence
    pub order: usize,
    /// Row within the pattern at `order`
    pub row: usize,
    /// Playback time in seconds since the start of the module
    pub time_seconds: f64,
    /// Backend clock reading at the moment the report was captured
    pub report_clock: f64,
}

/// Lifecycle state of one backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Playing,
    Paused,
    Error,
}

/// The three interchangeable audio-production strategies.
///
/// Declared in capability-preference order (most capable first); fallback
/// walks [`BackendKind::PREFERENCE`] top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Isolated worker with a shared fixed-layout telemetry record
    SharedMemoryWorker,
    /// Isolated worker with channel-based position events
    MessageWorker,
    /// Decoder driven synchronously on the audio-callback path
    SyncPull,
}

impl BackendKind {
    /// Fallback/selection order, most capable first
    pub const PREFERENCE: [BackendKind; 3] = [
        BackendKind::SharedMemoryWorker,
        BackendKind::MessageWorker,
        BackendKind::SyncPull,
    ];

    /// The next kind in preference order, wrapping around (for user cycling)
    pub fn next(&self) -> BackendKind {
        let idx = Self::PREFERENCE
            .iter()
            .position(|k| k == self)
            .unwrap_or(0);
        Self::PREFERENCE[(idx + 1) % Self::PREFERENCE.len()]
    }

    /// Human-readable name for status display
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::SharedMemoryWorker => "shared-memory worker",
            BackendKind::MessageWorker => "message worker",
            BackendKind::SyncPull => "sync pull",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_sample_operations() {
        let a = StereoSample::new(1.0, 2.0);
        let b = StereoSample::new(0.5, 0.5);

        let sum = a + b;
        assert_eq!(sum.left, 1.5);
        assert_eq!(sum.right, 2.5);

        let scaled = a * 0.5;
        assert_eq!(scaled.left, 0.5);
        assert_eq!(scaled.right, 1.0);
    }

    #[test]
    fn test_interleaved_view() {
        let mut buffer = StereoBuffer::silence(2);
        buffer[0] = StereoSample::new(1.0, 2.0);
        buffer[1] = StereoSample::new(3.0, 4.0);

        assert_eq!(buffer.as_interleaved(), &[1.0, 2.0, 3.0, 4.0]);

        buffer.as_interleaved_mut()[1] = 9.0;
        assert_eq!(buffer[0].right, 9.0);
    }

    #[test]
    fn test_set_len_from_capacity() {
        let mut buffer = StereoBuffer::silence(8);
        buffer[7] = StereoSample::new(1.0, 1.0);

        buffer.set_len_from_capacity(4);
        assert_eq!(buffer.len(), 4);

        // Growing back exposes silence, not stale data
        buffer.set_len_from_capacity(8);
        assert_eq!(buffer[7], StereoSample::silence());
    }

    #[test]
    fn test_backend_kind_cycle() {
        let mut kind = BackendKind::PREFERENCE[0];
        for _ in 0..BackendKind::PREFERENCE.len() {
            kind = kind.next();
        }
        assert_eq!(kind, BackendKind::PREFERENCE[0]);
        assert_eq!(
            BackendKind::SharedMemoryWorker.next(),
            BackendKind::MessageWorker
        );
        assert_eq!(BackendKind::SyncPull.next(), BackendKind::SharedMemoryWorker);
    }
}
