//! Synchronous-pull backend - decoder driven on the audio-callback path
//!
//! The decoder lives inside the [`SyncPullSource`] handed to the playback
//! engine, so every output quantum renders directly from the module and
//! position is read back immediately after the render. Nothing on this
//! path allocates or blocks: control reaches the source through a small
//! command ring plus atomics, and state comes back through atomics.
//!
//! Module load/destroy happen on the control thread, strictly before the
//! source is wired into the audio graph.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chipdeck_core::decoder::{DecoderFactory, ModuleDecoder};
use chipdeck_core::{EngineState, PlaybackPosition, StereoBuffer, MAX_VU_CHANNELS};

use crate::config::MAX_BUFFER_SIZE;
use crate::error::{EngineError, EngineResult};
use crate::source::SampleSource;

/// Capacity of the control ring into the source; control traffic is a
/// couple of messages per user action
const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Control messages applied by the source at a quantum boundary
enum SourceCommand {
    Seek { order: usize, row: usize },
    SetRepeat(bool),
}

/// Lock-free state the render path publishes for the control thread
#[derive(Default)]
struct SyncShared {
    playing: AtomicBool,
    ended: AtomicBool,
    order: AtomicU32,
    row: AtomicU32,
    /// f64 seconds as bits
    time_bits: AtomicU64,
    /// f64 seconds as bits (audio clock at capture)
    clock_bits: AtomicU64,
    /// f64 bpm as bits
    bpm_bits: AtomicU64,
    frames_rendered: AtomicU64,
    /// f32 levels as bits
    vu: [AtomicU32; MAX_VU_CHANNELS],
}

/// The backend handle owned by the orchestrator
pub struct SyncPullBackend {
    factory: Arc<dyn DecoderFactory>,
    state: EngineState,
    sample_rate: u32,
    shared: Option<Arc<SyncShared>>,
    control_tx: Option<rtrb::Producer<SourceCommand>>,
    pending_source: Option<Box<SyncPullSource>>,
    ended_reported: bool,
}

impl SyncPullBackend {
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            factory,
            state: EngineState::Uninitialized,
            sample_rate: 0,
            shared: None,
            control_tx: None,
            pending_source: None,
            ended_reported: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn initialize(&mut self, sample_rate_hint: u32) -> EngineResult<()> {
        if self.state != EngineState::Uninitialized {
            return Ok(());
        }
        self.state = EngineState::Initializing;
        if sample_rate_hint == 0 {
            self.state = EngineState::Error;
            return Err(EngineError::InitFailed("invalid sample rate".into()));
        }
        self.sample_rate = sample_rate_hint;
        self.state = EngineState::Ready;
        log::debug!("sync-pull backend ready at {} Hz", self.sample_rate);
        Ok(())
    }

    /// Create the decoder and the render source. Must complete before the
    /// source is installed into the audio graph; never call from a render
    /// callback.
    pub fn load_module(&mut self, bytes: &Arc<Vec<u8>>) -> EngineResult<()> {
        if self.state == EngineState::Uninitialized || self.sample_rate == 0 {
            return Err(EngineError::NotInitialized);
        }

        let decoder = self
            .factory
            .create(bytes)
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let shared = Arc::new(SyncShared::default());
        let (control_tx, control_rx) = rtrb::RingBuffer::new(CONTROL_QUEUE_CAPACITY);

        self.pending_source = Some(Box::new(SyncPullSource {
            decoder,
            sample_rate: self.sample_rate,
            shared: Arc::clone(&shared),
            control_rx,
            left: vec![0.0; MAX_BUFFER_SIZE],
            right: vec![0.0; MAX_BUFFER_SIZE],
        }));
        self.shared = Some(shared);
        self.control_tx = Some(control_tx);
        self.ended_reported = false;
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn take_source(&mut self) -> Option<Box<dyn SampleSource>> {
        self.pending_source
            .take()
            .map(|s| s as Box<dyn SampleSource>)
    }

    pub fn play(&mut self) {
        match &self.shared {
            Some(shared) => {
                shared.playing.store(true, Ordering::Relaxed);
                self.state = EngineState::Playing;
            }
            None => log::warn!("sync-pull play() before load_module"),
        }
    }

    pub fn pause(&mut self) {
        if let Some(shared) = &self.shared {
            shared.playing.store(false, Ordering::Relaxed);
            if self.state == EngineState::Playing {
                self.state = EngineState::Paused;
            }
        }
    }

    pub fn seek(&mut self, order: usize, row: usize) {
        self.ended_reported = false;
        if let Some(tx) = &mut self.control_tx {
            if tx.push(SourceCommand::Seek { order, row }).is_err() {
                log::warn!("sync-pull seek dropped: control queue full");
            }
        }
    }

    /// No-op: this backend produces raw samples; the mix stage owns gain
    pub fn set_volume(&mut self, _volume: f32) {}

    pub fn set_loop(&mut self, looping: bool) {
        if let Some(tx) = &mut self.control_tx {
            if tx.push(SourceCommand::SetRepeat(looping)).is_err() {
                log::warn!("sync-pull set_loop dropped: control queue full");
            }
        }
    }

    /// Atomics are always current; nothing to drain
    pub fn poll(&mut self) {}

    pub fn latest_report(&self) -> Option<PlaybackPosition> {
        let shared = self.shared.as_ref()?;
        if shared.frames_rendered.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(PlaybackPosition {
            order: shared.order.load(Ordering::Relaxed) as usize,
            row: shared.row.load(Ordering::Relaxed) as usize,
            time_seconds: f64::from_bits(shared.time_bits.load(Ordering::Relaxed)),
            report_clock: f64::from_bits(shared.clock_bits.load(Ordering::Relaxed)),
        })
    }

    pub fn bpm(&self) -> f64 {
        self.shared
            .as_ref()
            .map(|s| f64::from_bits(s.bpm_bits.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub fn vu(&self) -> [f32; MAX_VU_CHANNELS] {
        match &self.shared {
            Some(shared) => {
                std::array::from_fn(|i| f32::from_bits(shared.vu[i].load(Ordering::Relaxed)))
            }
            None => [0.0; MAX_VU_CHANNELS],
        }
    }

    pub fn take_ended(&mut self) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };
        if shared.ended.load(Ordering::Relaxed) && !self.ended_reported {
            self.ended_reported = true;
            return true;
        }
        false
    }

    /// The render path converts all failures to silence; no error channel
    pub fn take_error(&mut self) -> Option<String> {
        None
    }

    /// Audio clock: seconds of module audio rendered so far
    pub fn clock_seconds(&self) -> f64 {
        match &self.shared {
            Some(shared) if self.sample_rate > 0 => {
                shared.frames_rendered.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
            }
            _ => 0.0,
        }
    }

    pub fn underruns(&self) -> u32 {
        0
    }

    pub fn destroy(&mut self) {
        if let Some(shared) = &self.shared {
            shared.playing.store(false, Ordering::Relaxed);
        }
        self.shared = None;
        self.control_tx = None;
        self.pending_source = None;
        self.state = EngineState::Uninitialized;
    }
}

/// The render-side half: owns the decoder, lives in the audio callback
pub struct SyncPullSource {
    decoder: Box<dyn ModuleDecoder>,
    sample_rate: u32,
    shared: Arc<SyncShared>,
    control_rx: rtrb::Consumer<SourceCommand>,
    // Pre-allocated render scratch, sized for any device buffer
    left: Vec<f32>,
    right: Vec<f32>,
}

impl SyncPullSource {
    fn apply_commands(&mut self) {
        while let Ok(cmd) = self.control_rx.pop() {
            match cmd {
                SourceCommand::Seek { order, row } => {
                    self.decoder.set_position(order, row);
                    self.shared.ended.store(false, Ordering::Relaxed);
                    self.publish_position();
                }
                SourceCommand::SetRepeat(looping) => self.decoder.set_repeat(looping),
            }
        }
    }

    /// Derive position from the decoder and publish it to the atomics
    fn publish_position(&self) {
        let pos = self.decoder.position();
        let clock = self.shared.frames_rendered.load(Ordering::Relaxed) as f64
            / self.sample_rate as f64;
        self.shared.order.store(pos.order as u32, Ordering::Relaxed);
        self.shared.row.store(pos.row as u32, Ordering::Relaxed);
        self.shared
            .time_bits
            .store(pos.seconds.to_bits(), Ordering::Relaxed);
        self.shared
            .clock_bits
            .store(clock.to_bits(), Ordering::Relaxed);
        self.shared
            .bpm_bits
            .store(self.decoder.estimated_bpm().to_bits(), Ordering::Relaxed);
        for (i, cell) in self.shared.vu.iter().enumerate() {
            cell.store(self.decoder.channel_vu(i).to_bits(), Ordering::Relaxed);
        }
    }
}

impl SampleSource for SyncPullSource {
    fn pull(&mut self, out: &mut StereoBuffer) {
        self.apply_commands();
        out.fill_silence();

        if !self.shared.playing.load(Ordering::Relaxed)
            || self.shared.ended.load(Ordering::Relaxed)
        {
            return;
        }

        let frames = out.len();
        let samples = out.as_mut_slice();
        let mut offset = 0;
        while offset < frames {
            let request = (frames - offset).min(self.left.len());
            let rendered = self.decoder.render_stereo(
                self.sample_rate,
                &mut self.left[..request],
                &mut self.right[..request],
            );
            if rendered == 0 {
                self.shared.ended.store(true, Ordering::Relaxed);
                break;
            }
            for i in 0..rendered {
                samples[offset + i].left = self.left[i];
                samples[offset + i].right = self.right[i];
            }
            offset += rendered;
            self.shared
                .frames_rendered
                .fetch_add(rendered as u64, Ordering::Relaxed);
        }

        self.publish_position();
    }
}
