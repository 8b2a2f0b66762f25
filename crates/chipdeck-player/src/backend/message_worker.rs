//! Message-passing worker backend
//!
//! Module bytes and commands cross an asynchronous channel to an isolated
//! worker thread that owns its own decoder instance and renders ahead into
//! a lock-free audio ring. Position comes back as channel events throttled
//! to roughly 20 Hz, decoupled from the render rate.
//!
//! Loading is asynchronous: `load_module` blocks on the worker's explicit
//! `Loaded` acknowledgment (bounded by the configured timeout) so callers
//! never flip to "playing" before the worker actually has the module.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use chipdeck_core::decoder::{DecoderFactory, ModuleDecoder, ModuleMetadata};
use chipdeck_core::{EngineState, PlaybackPosition, StereoSample, MAX_VU_CHANNELS};

use super::{RENDER_CHUNK_FRAMES, REPORT_INTERVAL, WORKER_RING_FRAMES};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::source::{RingSource, SampleSource, WorkerShared};

/// Sleep while the ring is full
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(2);

/// Block on commands this long while there is nothing to render
const WORKER_COMMAND_WAIT: Duration = Duration::from_millis(20);

/// Commands into the worker
enum WorkerCommand {
    Load(Arc<Vec<u8>>),
    Seek { order: usize, row: usize },
    Play,
    Pause,
    SetRepeat(bool),
    Shutdown,
}

/// Events out of the worker
enum WorkerEvent {
    /// Worker thread is up and waiting for commands
    Ready,
    /// Module decoded and ready for playback
    Loaded(ModuleMetadata),
    /// Throttled position report, stamped on the worker clock
    Position { report: PlaybackPosition, bpm: f64 },
    /// Decoder signalled end-of-module
    Ended,
    /// Worker-internal failure, already stringified at the boundary
    Error(String),
}

/// The backend handle owned by the orchestrator
pub struct MessageWorkerBackend {
    factory: Arc<dyn DecoderFactory>,
    timeout: Duration,
    state: EngineState,
    sample_rate: u32,
    epoch: Instant,
    cmd_tx: Option<Sender<WorkerCommand>>,
    event_rx: Option<Receiver<WorkerEvent>>,
    shared: Option<Arc<WorkerShared>>,
    pending_source: Option<Box<RingSource>>,
    join: Option<JoinHandle<()>>,
    last_report: Option<PlaybackPosition>,
    bpm: f64,
    ended_latch: bool,
    error_latch: Option<String>,
}

impl MessageWorkerBackend {
    pub fn new(factory: Arc<dyn DecoderFactory>, config: &EngineConfig) -> Self {
        Self {
            factory,
            timeout: config.init_timeout(),
            state: EngineState::Uninitialized,
            sample_rate: 0,
            epoch: Instant::now(),
            cmd_tx: None,
            event_rx: None,
            shared: None,
            pending_source: None,
            join: None,
            last_report: None,
            bpm: 0.0,
            ended_latch: false,
            error_latch: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Spawn the worker and wait (bounded) for its readiness handshake
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
        self.epoch = Instant::now();

        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (producer, consumer) = rtrb::RingBuffer::<StereoSample>::new(WORKER_RING_FRAMES);
        let shared = Arc::new(WorkerShared::default());

        let worker = Worker {
            factory: Arc::clone(&self.factory),
            sample_rate: self.sample_rate,
            epoch: self.epoch,
            producer,
            event_tx,
            decoder: None,
            playing: false,
            ended: false,
            last_emit: None,
            left: vec![0.0; RENDER_CHUNK_FRAMES],
            right: vec![0.0; RENDER_CHUNK_FRAMES],
        };
        let join = thread::Builder::new()
            .name("chipdeck-worker".into())
            .spawn(move || worker.run(cmd_rx))
            .map_err(|e| {
                self.state = EngineState::Error;
                EngineError::InitFailed(format!("worker spawn failed: {e}"))
            })?;

        // Bounded wait for the handshake; a hung runtime fails over instead
        // of blocking the session
        match event_rx.recv_timeout(self.timeout) {
            Ok(WorkerEvent::Ready) => {}
            Ok(_) | Err(RecvTimeoutError::Timeout) => {
                self.state = EngineState::Error;
                return Err(EngineError::InitFailed(
                    "worker readiness handshake timed out".into(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.state = EngineState::Error;
                return Err(EngineError::InitFailed("worker exited during startup".into()));
            }
        }

        self.pending_source = Some(Box::new(RingSource::new(consumer, Arc::clone(&shared))));
        self.shared = Some(shared);
        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self.join = Some(join);
        self.state = EngineState::Ready;
        log::debug!("message worker ready at {} Hz", self.sample_rate);
        Ok(())
    }

    /// Send the module to the worker and wait for the `Loaded` ack
    pub fn load_module(&mut self, bytes: &Arc<Vec<u8>>) -> EngineResult<()> {
        if self.state == EngineState::Uninitialized || self.state == EngineState::Initializing {
            return Err(EngineError::NotInitialized);
        }
        self.send(WorkerCommand::Load(Arc::clone(bytes)))?;

        let deadline = Instant::now() + self.timeout;
        let event_rx = self.event_rx.as_ref().ok_or(EngineError::NotInitialized)?;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(EngineError::LoadTimeout)?;
            match event_rx.recv_timeout(remaining) {
                Ok(WorkerEvent::Loaded(meta)) => {
                    log::debug!("worker loaded module \"{}\"", meta.title);
                    self.last_report = None;
                    self.ended_latch = false;
                    self.bpm = meta.initial_bpm;
                    return Ok(());
                }
                Ok(WorkerEvent::Error(message)) => return Err(EngineError::Backend(message)),
                // Stale position/ended events from before the load
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(EngineError::LoadTimeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Backend("worker terminated".into()))
                }
            }
        }
    }

    pub fn take_source(&mut self) -> Option<Box<dyn SampleSource>> {
        self.pending_source
            .take()
            .map(|s| s as Box<dyn SampleSource>)
    }

    pub fn play(&mut self) {
        if self.send(WorkerCommand::Play).is_ok() {
            if let Some(shared) = &self.shared {
                shared.playing.store(true, Ordering::Relaxed);
            }
            self.state = EngineState::Playing;
        }
    }

    pub fn pause(&mut self) {
        if self.send(WorkerCommand::Pause).is_ok() {
            if let Some(shared) = &self.shared {
                shared.playing.store(false, Ordering::Relaxed);
            }
            if self.state == EngineState::Playing {
                self.state = EngineState::Paused;
            }
        }
    }

    pub fn seek(&mut self, order: usize, row: usize) {
        self.ended_latch = false;
        let _ = self.send(WorkerCommand::Seek { order, row });
    }

    /// No-op: this backend produces raw samples; the mix stage owns gain
    pub fn set_volume(&mut self, _volume: f32) {}

    pub fn set_loop(&mut self, looping: bool) {
        let _ = self.send(WorkerCommand::SetRepeat(looping));
    }

    /// Drain pending worker events into the latches
    pub fn poll(&mut self) {
        let Some(event_rx) = &self.event_rx else {
            return;
        };
        loop {
            match event_rx.try_recv() {
                Ok(WorkerEvent::Position { report, bpm }) => {
                    self.last_report = Some(report);
                    if bpm > 0.0 {
                        self.bpm = bpm;
                    }
                }
                Ok(WorkerEvent::Ended) => self.ended_latch = true,
                Ok(WorkerEvent::Error(message)) => {
                    self.state = EngineState::Error;
                    self.error_latch = Some(message);
                }
                Ok(WorkerEvent::Ready) | Ok(WorkerEvent::Loaded(_)) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state != EngineState::Error {
                        self.state = EngineState::Error;
                        self.error_latch = Some("worker terminated".into());
                    }
                    break;
                }
            }
        }
    }

    pub fn latest_report(&self) -> Option<PlaybackPosition> {
        self.last_report
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// This backend's wire protocol carries no VU data
    pub fn vu(&self) -> [f32; MAX_VU_CHANNELS] {
        [0.0; MAX_VU_CHANNELS]
    }

    pub fn take_ended(&mut self) -> bool {
        std::mem::take(&mut self.ended_latch)
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.error_latch.take()
    }

    /// Monotonic clock anchored at backend initialization; the worker
    /// stamps reports with the same epoch
    pub fn clock_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn underruns(&self) -> u32 {
        self.shared
            .as_ref()
            .map(|s| s.underruns.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn destroy(&mut self) {
        if let Some(shared) = &self.shared {
            shared.playing.store(false, Ordering::Relaxed);
        }
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("message worker panicked during shutdown");
            }
        }
        self.event_rx = None;
        self.shared = None;
        self.pending_source = None;
        self.last_report = None;
        self.state = EngineState::Uninitialized;
    }

    fn send(&mut self, cmd: WorkerCommand) -> EngineResult<()> {
        match &self.cmd_tx {
            Some(tx) => tx.send(cmd).map_err(|_| {
                self.state = EngineState::Error;
                EngineError::Backend("worker terminated".into())
            }),
            None => {
                log::warn!("message-worker command before initialize");
                Err(EngineError::NotInitialized)
            }
        }
    }
}

impl Drop for MessageWorkerBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Worker-thread state: owns the decoder, renders ahead, reports position
struct Worker {
    factory: Arc<dyn DecoderFactory>,
    sample_rate: u32,
    epoch: Instant,
    producer: rtrb::Producer<StereoSample>,
    event_tx: Sender<WorkerEvent>,
    decoder: Option<Box<dyn ModuleDecoder>>,
    playing: bool,
    ended: bool,
    last_emit: Option<Duration>,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Worker {
    fn run(mut self, cmd_rx: Receiver<WorkerCommand>) {
        let _ = self.event_tx.send(WorkerEvent::Ready);

        loop {
            // Drain all pending commands first
            loop {
                match cmd_rx.try_recv() {
                    Ok(cmd) => {
                        if self.handle(cmd) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if self.playing && !self.ended && self.decoder.is_some() {
                self.render_ahead();
            } else {
                // Idle: block on the next command instead of spinning
                match cmd_rx.recv_timeout(WORKER_COMMAND_WAIT) {
                    Ok(cmd) => {
                        if self.handle(cmd) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }

    /// Apply one command; returns true on shutdown
    fn handle(&mut self, cmd: WorkerCommand) -> bool {
        match cmd {
            WorkerCommand::Load(bytes) => {
                // Destroy the previous handle before creating the new one
                self.decoder = None;
                self.playing = false;
                self.ended = false;
                self.last_emit = None;
                match self.factory.create(&bytes) {
                    Ok(decoder) => {
                        let _ = self.event_tx.send(WorkerEvent::Loaded(decoder.metadata()));
                        self.decoder = Some(decoder);
                    }
                    Err(e) => {
                        let _ = self.event_tx.send(WorkerEvent::Error(e.to_string()));
                    }
                }
            }
            WorkerCommand::Seek { order, row } => {
                if let Some(decoder) = &mut self.decoder {
                    decoder.set_position(order, row);
                    self.ended = false;
                }
                self.emit_position(true);
            }
            WorkerCommand::Play => self.playing = true,
            WorkerCommand::Pause => self.playing = false,
            WorkerCommand::SetRepeat(looping) => {
                if let Some(decoder) = &mut self.decoder {
                    decoder.set_repeat(looping);
                }
            }
            WorkerCommand::Shutdown => return true,
        }
        false
    }

    /// Render one chunk into the ring if there is room
    fn render_ahead(&mut self) {
        if self.producer.slots() < RENDER_CHUNK_FRAMES {
            thread::sleep(WORKER_IDLE_WAIT);
            return;
        }
        let Some(decoder) = &mut self.decoder else {
            return;
        };
        let rendered = decoder.render_stereo(self.sample_rate, &mut self.left, &mut self.right);
        if rendered == 0 {
            self.ended = true;
            let _ = self.event_tx.send(WorkerEvent::Ended);
            return;
        }
        for i in 0..rendered {
            let _ = self
                .producer
                .push(StereoSample::new(self.left[i], self.right[i]));
        }
        self.emit_position(false);
    }

    /// Send a throttled (or forced) position event
    fn emit_position(&mut self, force: bool) {
        let Some(decoder) = &self.decoder else {
            return;
        };
        let now = self.epoch.elapsed();
        if !force && self.last_emit.is_some_and(|t| now - t < REPORT_INTERVAL) {
            return;
        }
        self.last_emit = Some(now);
        let pos = decoder.position();
        let _ = self.event_tx.send(WorkerEvent::Position {
            report: PlaybackPosition {
                order: pos.order,
                row: pos.row,
                time_seconds: pos.seconds,
                report_clock: now.as_secs_f64(),
            },
            bpm: decoder.estimated_bpm(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chipdeck_core::decoder::fixture::{basic_module, FixtureDecoderFactory};
    use chipdeck_core::StereoBuffer;

    fn config() -> EngineConfig {
        EngineConfig::default().with_init_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_load_before_initialize_is_an_error() {
        let mut backend = MessageWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        assert_eq!(
            backend.load_module(&Arc::new(basic_module())),
            Err(EngineError::NotInitialized)
        );
    }

    #[test]
    fn test_invalid_module_reports_backend_error() {
        let mut backend = MessageWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        backend.initialize(44_100).unwrap();
        let result = backend.load_module(&Arc::new(b"garbage".to_vec()));
        assert!(matches!(result, Err(EngineError::Backend(_))));
        backend.destroy();
    }

    #[test]
    fn test_load_play_and_position_events() {
        let mut backend = MessageWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        backend.initialize(44_100).unwrap();
        backend.load_module(&Arc::new(basic_module())).unwrap();
        let mut source = backend.take_source().unwrap();
        backend.play();

        // Drain the ring like an audio callback would and let the worker
        // render/report for a few intervals
        let mut out = StereoBuffer::silence(1024);
        let mut heard_audio = false;
        for _ in 0..30 {
            thread::sleep(Duration::from_millis(10));
            source.pull(&mut out);
            heard_audio |= out.peak() > 0.0;
            backend.poll();
        }

        assert!(heard_audio);
        let report = backend.latest_report().expect("position events arrived");
        assert!(report.time_seconds > 0.0);
        assert!(report.report_clock > 0.0);
        assert!(backend.bpm() > 0.0);
        backend.destroy();
    }

    #[test]
    fn test_seek_reports_within_one_interval() {
        let mut backend = MessageWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        backend.initialize(44_100).unwrap();
        backend.load_module(&Arc::new(basic_module())).unwrap();

        backend.seek(0, 32);
        thread::sleep(REPORT_INTERVAL);
        backend.poll();
        let report = backend.latest_report().expect("forced seek report");
        assert_eq!((report.order, report.row), (0, 32));
        backend.destroy();
    }

    #[test]
    fn test_destroy_joins_worker() {
        let mut backend = MessageWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        backend.initialize(44_100).unwrap();
        backend.destroy();
        assert_eq!(backend.state(), EngineState::Uninitialized);
        // Idempotent
        backend.destroy();
    }
}
