//! Decoder adapter - capability interface over an external module decoder
//!
//! Chipdeck does not decode tracker formats itself. Backends consume a
//! [`ModuleDecoder`] produced by a [`DecoderFactory`]; the factory is the
//! only place raw module bytes are interpreted. Each backend owns exactly
//! one decoder instance, never shared across threads, which keeps the
//! decoder free of any internal synchronization requirements.

use thiserror::Error;

#[cfg(any(test, feature = "fixture"))]
pub mod fixture;

/// Errors produced while creating a decoder from raw module bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte stream is not a recognized module container
    #[error("not a recognized module container")]
    InvalidFormat,
}

/// Metadata describing a successfully loaded module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleMetadata {
    /// Module title (may be empty)
    pub title: String,
    /// Number of entries in the play sequence
    pub num_orders: usize,
    /// Number of distinct patterns
    pub num_patterns: usize,
    /// Number of channels
    pub num_channels: usize,
    /// Estimated total duration in seconds
    pub duration_seconds: f64,
    /// Estimated tempo at the start of the module
    pub initial_bpm: f64,
}

/// Current decoder playback position
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecoderPosition {
    pub order: usize,
    pub row: usize,
    pub seconds: f64,
}

/// The six per-cell fields a decoder can be queried for.
///
/// Values are backend-agnostic small integers; 0 means absent/empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CellField {
    Note = 0,
    Instrument = 1,
    VolumeCommand = 2,
    VolumeValue = 3,
    EffectCommand = 4,
    EffectValue = 5,
}

impl CellField {
    /// All fields in query order
    pub const ALL: [CellField; 6] = [
        CellField::Note,
        CellField::Instrument,
        CellField::VolumeCommand,
        CellField::VolumeValue,
        CellField::EffectCommand,
        CellField::EffectValue,
    ];
}

/// One decoded module, exclusively owned by its consumer.
///
/// Destruction is expressed through `Drop`; replacing a module means
/// dropping the old decoder before (or while) creating the new one.
pub trait ModuleDecoder: Send {
    /// Metadata captured at load time
    fn metadata(&self) -> ModuleMetadata;

    /// Render up to `left.len()` stereo frames at `sample_rate`.
    ///
    /// Returns the number of frames written. A return of 0 signals the end
    /// of the module; it is a terminal render condition, not an error.
    /// `left` and `right` must be the same length.
    fn render_stereo(&mut self, sample_rate: u32, left: &mut [f32], right: &mut [f32]) -> usize;

    /// Jump playback to the given order and row (clamped to valid range)
    fn set_position(&mut self, order: usize, row: usize);

    /// Current playback position
    fn position(&self) -> DecoderPosition;

    /// Current estimated tempo in BPM
    fn estimated_bpm(&self) -> f64;

    /// Resolve an order index to the pattern it plays
    fn order_pattern(&self, order: usize) -> usize;

    /// Number of rows in the given pattern
    fn pattern_num_rows(&self, pattern: usize) -> usize;

    /// Read one cell field; 0 for out-of-range coordinates
    fn cell(&self, pattern: usize, row: usize, channel: usize, field: CellField) -> i32;

    /// Instantaneous mono VU level for a channel (0.0..=1.0)
    fn channel_vu(&self, channel: usize) -> f32;

    /// Enable or disable decoder-internal repeat.
    ///
    /// With repeat enabled the decoder wraps to the start instead of
    /// signalling end-of-module. The orchestrator keeps this off and owns
    /// loop semantics itself, so they are identical across backends.
    fn set_repeat(&mut self, repeat: bool);
}

/// Creates decoder instances from raw module bytes.
///
/// Shared across threads (worker backends create their decoder on the
/// worker thread), hence `Send + Sync`.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, bytes: &[u8]) -> Result<Box<dyn ModuleDecoder>, DecodeError>;
}
