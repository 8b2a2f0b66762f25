//! Backend implementations - three audio-production strategies, one contract
//!
//! All three backends expose the same surface (initialize / load / play /
//! pause / seek / volume / loop / destroy plus position reports and an
//! "ended" signal), but differ in execution model:
//!
//! - [`SyncPullBackend`]: the decoder renders synchronously inside the
//!   audio callback; simplest and most accurate, but decode cost lands on
//!   the real-time path.
//! - [`MessageWorkerBackend`]: an isolated worker thread owns its decoder
//!   and renders ahead into a lock-free ring; position comes back as
//!   throttled channel events.
//! - [`SharedMemoryWorkerBackend`]: same worker shape, but telemetry is
//!   published through a fixed-layout shared record the orchestrator polls.
//!
//! The contract is a tagged variant rather than a trait object so the
//! orchestrator can see exactly which report mode (pull/push/poll) produced
//! a given position, which the synchronizer's extrapolation depends on.

use std::sync::Arc;
use std::time::Duration;

use chipdeck_core::decoder::DecoderFactory;
use chipdeck_core::{BackendKind, EngineState, PlaybackPosition, MAX_VU_CHANNELS};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::source::SampleSource;
use crate::sync::ReportMode;

pub mod message_worker;
pub mod shared_memory;
pub mod sync_pull;

pub use message_worker::MessageWorkerBackend;
pub use shared_memory::SharedMemoryWorkerBackend;
pub use sync_pull::SyncPullBackend;

/// Throttle for pushed position events (~20 Hz)
pub const REPORT_INTERVAL: Duration = Duration::from_millis(50);

/// Capacity of a worker backend's audio ring in frames (~93 ms at 44.1 kHz).
/// Bounds both render-ahead and the staleness of buffered audio after a
/// seek, keeping worker seeks best-effort within about one ring.
pub const WORKER_RING_FRAMES: usize = 4096;

/// Frames a worker renders per chunk
pub const RENDER_CHUNK_FRAMES: usize = 1024;

/// The active backend, dispatching the shared contract to whichever
/// implementation was selected
pub enum ActiveBackend {
    SyncPull(SyncPullBackend),
    MessageWorker(MessageWorkerBackend),
    SharedMemory(SharedMemoryWorkerBackend),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            ActiveBackend::SyncPull($inner) => $body,
            ActiveBackend::MessageWorker($inner) => $body,
            ActiveBackend::SharedMemory($inner) => $body,
        }
    };
}

impl ActiveBackend {
    /// Construct an (uninitialized) backend of the given kind
    pub fn create(
        kind: BackendKind,
        factory: Arc<dyn DecoderFactory>,
        config: &EngineConfig,
    ) -> Self {
        match kind {
            BackendKind::SyncPull => ActiveBackend::SyncPull(SyncPullBackend::new(factory)),
            BackendKind::MessageWorker => {
                ActiveBackend::MessageWorker(MessageWorkerBackend::new(factory, config))
            }
            BackendKind::SharedMemoryWorker => {
                ActiveBackend::SharedMemory(SharedMemoryWorkerBackend::new(factory, config))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ActiveBackend::SyncPull(_) => BackendKind::SyncPull,
            ActiveBackend::MessageWorker(_) => BackendKind::MessageWorker,
            ActiveBackend::SharedMemory(_) => BackendKind::SharedMemoryWorker,
        }
    }

    pub fn report_mode(&self) -> ReportMode {
        match self {
            ActiveBackend::SyncPull(_) => ReportMode::Pull,
            ActiveBackend::MessageWorker(_) => ReportMode::Push,
            ActiveBackend::SharedMemory(_) => ReportMode::Poll,
        }
    }

    pub fn state(&self) -> EngineState {
        dispatch!(self, b => b.state())
    }

    /// Bring the backend up. Failure marks this kind unavailable for the
    /// session at the orchestrator level; it is never fatal on its own.
    pub fn initialize(&mut self, sample_rate_hint: u32) -> EngineResult<()> {
        dispatch!(self, b => b.initialize(sample_rate_hint))
    }

    /// Load a module into this backend's own decoder instance
    pub fn load_module(&mut self, bytes: &Arc<Vec<u8>>) -> EngineResult<()> {
        dispatch!(self, b => b.load_module(bytes))
    }

    /// Take the sample source to install into the playback engine.
    /// Available once per successful `load_module`.
    pub fn take_source(&mut self) -> Option<Box<dyn SampleSource>> {
        dispatch!(self, b => b.take_source())
    }

    pub fn play(&mut self) {
        dispatch!(self, b => b.play())
    }

    pub fn pause(&mut self) {
        dispatch!(self, b => b.pause())
    }

    pub fn seek(&mut self, order: usize, row: usize) {
        dispatch!(self, b => b.seek(order, row))
    }

    /// Only the shared-memory worker applies gain internally; the other
    /// backends produce raw samples and leave gain to the mix stage.
    pub fn set_volume(&mut self, volume: f32) {
        dispatch!(self, b => b.set_volume(volume))
    }

    /// Forwarded to the backend decoder's repeat setting. The orchestrator
    /// keeps this off and implements looping itself so loop semantics do
    /// not depend on the active backend.
    pub fn set_loop(&mut self, looping: bool) {
        dispatch!(self, b => b.set_loop(looping))
    }

    /// Ingest pending reports/events; call on the display cadence
    pub fn poll(&mut self) {
        dispatch!(self, b => b.poll())
    }

    pub fn latest_report(&self) -> Option<PlaybackPosition> {
        dispatch!(self, b => b.latest_report())
    }

    pub fn bpm(&self) -> f64 {
        dispatch!(self, b => b.bpm())
    }

    pub fn vu(&self) -> [f32; MAX_VU_CHANNELS] {
        dispatch!(self, b => b.vu())
    }

    /// One-shot "module ended" edge; re-armed by the next seek
    pub fn take_ended(&mut self) -> bool {
        dispatch!(self, b => b.take_ended())
    }

    /// One-shot backend failure report
    pub fn take_error(&mut self) -> Option<String> {
        dispatch!(self, b => b.take_error())
    }

    /// Current reading of the clock this backend stamps reports with
    pub fn clock_seconds(&self) -> f64 {
        dispatch!(self, b => b.clock_seconds())
    }

    /// Ring underruns observed by this backend's source (0 for sync-pull)
    pub fn underruns(&self) -> u32 {
        dispatch!(self, b => b.underruns())
    }

    /// Tear down the backend (stops workers, drops the decoder handle)
    pub fn destroy(&mut self) {
        dispatch!(self, b => b.destroy())
    }
}
