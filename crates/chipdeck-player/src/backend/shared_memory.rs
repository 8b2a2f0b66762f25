//! Shared-memory worker backend
//!
//! The heaviest-weight backend: commands travel over the same kind of
//! asynchronous channel as the message worker, but position/VU telemetry is
//! published through the fixed-layout [`SharedPositionRecord`] after every
//! rendered chunk. The orchestrator polls the record on its own wall-clock
//! cadence instead of waiting for pushed events; a torn or unpublished
//! record simply reads as "no update this poll".
//!
//! Unlike the other backends this worker applies its own gain to the
//! rendered samples, so the orchestrator pushes volume changes here and
//! bypasses the mix-stage gain while this backend is active.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use chipdeck_core::decoder::{DecoderFactory, ModuleDecoder, ModuleMetadata};
use chipdeck_core::record::{PositionRecord, SharedPositionRecord, ROW_ENDED};
use chipdeck_core::{EngineState, PlaybackPosition, StereoSample, MAX_VU_CHANNELS};

use super::{RENDER_CHUNK_FRAMES, WORKER_RING_FRAMES};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::source::{RingSource, SampleSource, WorkerShared};

/// Sleep while the ring is full
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(2);

/// Block on commands this long while there is nothing to render
const WORKER_COMMAND_WAIT: Duration = Duration::from_millis(20);

/// Commands into the worker
enum ShmCommand {
    Load(Arc<Vec<u8>>),
    Seek { order: usize, row: usize },
    Play,
    Pause,
    SetRepeat(bool),
    SetVolume(f32),
    Shutdown,
}

/// Control-plane events out of the worker. Position and end-of-module are
/// not events here; they live in the shared record.
enum ShmEvent {
    Ready,
    Loaded(ModuleMetadata),
    Error(String),
}

/// The backend handle owned by the orchestrator
pub struct SharedMemoryWorkerBackend {
    factory: Arc<dyn DecoderFactory>,
    timeout: Duration,
    state: EngineState,
    sample_rate: u32,
    epoch: Instant,
    record: Arc<SharedPositionRecord>,
    cmd_tx: Option<Sender<ShmCommand>>,
    event_rx: Option<Receiver<ShmEvent>>,
    shared: Option<Arc<WorkerShared>>,
    pending_source: Option<Box<RingSource>>,
    join: Option<JoinHandle<()>>,
    last_report: Option<PlaybackPosition>,
    last_vu: [f32; MAX_VU_CHANNELS],
    bpm: f64,
    sentinel_seen: bool,
    ended_latch: bool,
    error_latch: Option<String>,
}

impl SharedMemoryWorkerBackend {
    pub fn new(factory: Arc<dyn DecoderFactory>, config: &EngineConfig) -> Self {
        Self {
            factory,
            timeout: config.init_timeout(),
            state: EngineState::Uninitialized,
            sample_rate: 0,
            epoch: Instant::now(),
            record: Arc::new(SharedPositionRecord::new()),
            cmd_tx: None,
            event_rx: None,
            shared: None,
            pending_source: None,
            join: None,
            last_report: None,
            last_vu: [0.0; MAX_VU_CHANNELS],
            bpm: 0.0,
            sentinel_seen: false,
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
        self.record.clear();

        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (producer, consumer) = rtrb::RingBuffer::<StereoSample>::new(WORKER_RING_FRAMES);
        let shared = Arc::new(WorkerShared::default());

        let worker = ShmWorker {
            factory: Arc::clone(&self.factory),
            sample_rate: self.sample_rate,
            record: Arc::clone(&self.record),
            producer,
            event_tx,
            decoder: None,
            num_channels: 0,
            playing: false,
            ended: false,
            gain: 1.0,
            left: vec![0.0; RENDER_CHUNK_FRAMES],
            right: vec![0.0; RENDER_CHUNK_FRAMES],
        };
        let join = thread::Builder::new()
            .name("chipdeck-shm-worker".into())
            .spawn(move || worker.run(cmd_rx))
            .map_err(|e| {
                self.state = EngineState::Error;
                EngineError::InitFailed(format!("worker spawn failed: {e}"))
            })?;

        match event_rx.recv_timeout(self.timeout) {
            Ok(ShmEvent::Ready) => {}
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
        log::debug!("shared-memory worker ready at {} Hz", self.sample_rate);
        Ok(())
    }

    /// Send the module to the worker and wait for the `Loaded` ack
    pub fn load_module(&mut self, bytes: &Arc<Vec<u8>>) -> EngineResult<()> {
        if self.state == EngineState::Uninitialized || self.state == EngineState::Initializing {
            return Err(EngineError::NotInitialized);
        }
        self.send(ShmCommand::Load(Arc::clone(bytes)))?;

        let deadline = Instant::now() + self.timeout;
        let event_rx = self.event_rx.as_ref().ok_or(EngineError::NotInitialized)?;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(EngineError::LoadTimeout)?;
            match event_rx.recv_timeout(remaining) {
                Ok(ShmEvent::Loaded(meta)) => {
                    log::debug!("shm worker loaded module \"{}\"", meta.title);
                    self.last_report = None;
                    self.sentinel_seen = false;
                    self.ended_latch = false;
                    self.bpm = meta.initial_bpm;
                    return Ok(());
                }
                Ok(ShmEvent::Error(message)) => return Err(EngineError::Backend(message)),
                Ok(ShmEvent::Ready) => {}
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
        if self.send(ShmCommand::Play).is_ok() {
            if let Some(shared) = &self.shared {
                shared.playing.store(true, Ordering::Relaxed);
            }
            self.state = EngineState::Playing;
        }
    }

    pub fn pause(&mut self) {
        if self.send(ShmCommand::Pause).is_ok() {
            if let Some(shared) = &self.shared {
                shared.playing.store(false, Ordering::Relaxed);
            }
            if self.state == EngineState::Playing {
                self.state = EngineState::Paused;
            }
        }
    }

    pub fn seek(&mut self, order: usize, row: usize) {
        self.sentinel_seen = false;
        self.ended_latch = false;
        let _ = self.send(ShmCommand::Seek { order, row });
    }

    /// This worker applies gain internally; the orchestrator keeps this in
    /// step with the user volume and bypasses the mix-stage gain meanwhile
    pub fn set_volume(&mut self, volume: f32) {
        let _ = self.send(ShmCommand::SetVolume(volume.clamp(0.0, 1.0)));
    }

    pub fn set_loop(&mut self, looping: bool) {
        let _ = self.send(ShmCommand::SetRepeat(looping));
    }

    /// Poll the shared record; runs on the orchestrator's display cadence
    pub fn poll(&mut self) {
        // Control-plane events (load errors after the ack, worker death)
        if let Some(event_rx) = &self.event_rx {
            loop {
                match event_rx.try_recv() {
                    Ok(ShmEvent::Error(message)) => {
                        self.state = EngineState::Error;
                        self.error_latch = Some(message);
                    }
                    Ok(_) => {}
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

        // Telemetry; a torn or unpublished record is "no update this poll"
        let Some(record) = self.record.read() else {
            return;
        };
        if record.ended() {
            if !self.sentinel_seen {
                self.sentinel_seen = true;
                self.ended_latch = true;
            }
            return;
        }
        self.sentinel_seen = false;
        self.last_report = Some(PlaybackPosition {
            order: record.order as usize,
            row: record.row as usize,
            time_seconds: record.position_ms / 1000.0,
            report_clock: self.clock_seconds(),
        });
        if record.bpm > 0.0 {
            self.bpm = record.bpm;
        }
        self.last_vu = record.channel_vu;
    }

    pub fn latest_report(&self) -> Option<PlaybackPosition> {
        self.last_report
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn vu(&self) -> [f32; MAX_VU_CHANNELS] {
        self.last_vu
    }

    pub fn take_ended(&mut self) -> bool {
        std::mem::take(&mut self.ended_latch)
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.error_latch.take()
    }

    /// Monotonic clock anchored at backend initialization
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
            let _ = tx.send(ShmCommand::Shutdown);
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("shared-memory worker panicked during shutdown");
            }
        }
        self.record.clear();
        self.event_rx = None;
        self.shared = None;
        self.pending_source = None;
        self.last_report = None;
        self.state = EngineState::Uninitialized;
    }

    fn send(&mut self, cmd: ShmCommand) -> EngineResult<()> {
        match &self.cmd_tx {
            Some(tx) => tx.send(cmd).map_err(|_| {
                self.state = EngineState::Error;
                EngineError::Backend("worker terminated".into())
            }),
            None => {
                log::warn!("shared-memory command before initialize");
                Err(EngineError::NotInitialized)
            }
        }
    }
}

impl Drop for SharedMemoryWorkerBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Worker-thread state: owns the decoder and publishes the shared record
struct ShmWorker {
    factory: Arc<dyn DecoderFactory>,
    sample_rate: u32,
    record: Arc<SharedPositionRecord>,
    producer: rtrb::Producer<StereoSample>,
    event_tx: Sender<ShmEvent>,
    decoder: Option<Box<dyn ModuleDecoder>>,
    num_channels: usize,
    playing: bool,
    ended: bool,
    gain: f32,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl ShmWorker {
    fn run(mut self, cmd_rx: Receiver<ShmCommand>) {
        let _ = self.event_tx.send(ShmEvent::Ready);

        loop {
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
    fn handle(&mut self, cmd: ShmCommand) -> bool {
        match cmd {
            ShmCommand::Load(bytes) => {
                self.decoder = None;
                self.playing = false;
                self.ended = false;
                self.record.clear();
                match self.factory.create(&bytes) {
                    Ok(decoder) => {
                        let meta = decoder.metadata();
                        self.num_channels = meta.num_channels;
                        let _ = self.event_tx.send(ShmEvent::Loaded(meta));
                        self.decoder = Some(decoder);
                        self.publish_record();
                    }
                    Err(e) => {
                        let _ = self.event_tx.send(ShmEvent::Error(e.to_string()));
                    }
                }
            }
            ShmCommand::Seek { order, row } => {
                if let Some(decoder) = &mut self.decoder {
                    decoder.set_position(order, row);
                    self.ended = false;
                }
                self.publish_record();
            }
            ShmCommand::Play => self.playing = true,
            ShmCommand::Pause => self.playing = false,
            ShmCommand::SetRepeat(looping) => {
                if let Some(decoder) = &mut self.decoder {
                    decoder.set_repeat(looping);
                }
            }
            ShmCommand::SetVolume(volume) => self.gain = volume,
            ShmCommand::Shutdown => return true,
        }
        false
    }

    /// Render one gain-scaled chunk into the ring if there is room
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
            self.publish_ended();
            return;
        }
        for i in 0..rendered {
            let _ = self.producer.push(StereoSample::new(
                self.left[i] * self.gain,
                self.right[i] * self.gain,
            ));
        }
        self.publish_record();
    }

    /// Write the current position/VU snapshot into the shared record
    fn publish_record(&self) {
        let Some(decoder) = &self.decoder else {
            return;
        };
        let pos = decoder.position();
        let mut channel_vu = [0.0f32; MAX_VU_CHANNELS];
        for (i, vu) in channel_vu.iter_mut().enumerate().take(self.num_channels) {
            *vu = decoder.channel_vu(i);
        }
        self.record.write(&PositionRecord {
            position_ms: pos.seconds * 1000.0,
            row: pos.row as i32,
            pattern: decoder.order_pattern(pos.order) as i32,
            order: pos.order as i32,
            bpm: decoder.estimated_bpm(),
            num_channels: self.num_channels as i32,
            channel_vu,
        });
    }

    /// Publish the end-of-module sentinel
    fn publish_ended(&self) {
        let Some(decoder) = &self.decoder else {
            return;
        };
        let pos = decoder.position();
        self.record.write(&PositionRecord {
            position_ms: pos.seconds * 1000.0,
            row: ROW_ENDED,
            pattern: decoder.order_pattern(pos.order) as i32,
            order: pos.order as i32,
            bpm: decoder.estimated_bpm(),
            num_channels: self.num_channels as i32,
            channel_vu: [0.0; MAX_VU_CHANNELS],
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

    fn ready_backend() -> SharedMemoryWorkerBackend {
        let mut backend =
            SharedMemoryWorkerBackend::new(Arc::new(FixtureDecoderFactory), &config());
        backend.initialize(44_100).unwrap();
        backend.load_module(&Arc::new(basic_module())).unwrap();
        backend
    }

    #[test]
    fn test_record_published_on_load() {
        let mut backend = ready_backend();
        backend.poll();
        let report = backend.latest_report().expect("record published at load");
        assert_eq!((report.order, report.row), (0, 0));
        assert!(backend.bpm() > 0.0);
        backend.destroy();
    }

    #[test]
    fn test_playback_updates_record_and_vu() {
        let mut backend = ready_backend();
        let mut source = backend.take_source().unwrap();
        backend.play();

        let mut out = StereoBuffer::silence(1024);
        let mut last_time = 0.0;
        for _ in 0..30 {
            thread::sleep(Duration::from_millis(10));
            source.pull(&mut out);
            backend.poll();
            if let Some(report) = backend.latest_report() {
                assert!(report.time_seconds >= last_time);
                last_time = report.time_seconds;
            }
        }
        assert!(last_time > 0.0);
        // Channel 0 carries the first note of the fixture module
        assert!(backend.vu()[0] > 0.0);
        backend.destroy();
    }

    #[test]
    fn test_seek_refreshes_record() {
        let mut backend = ready_backend();
        backend.seek(0, 48);
        thread::sleep(Duration::from_millis(50));
        backend.poll();
        let report = backend.latest_report().unwrap();
        assert_eq!((report.order, report.row), (0, 48));
        backend.destroy();
    }

    #[test]
    fn test_volume_scales_worker_output() {
        let mut backend = ready_backend();
        let mut source = backend.take_source().unwrap();
        backend.set_volume(0.0);
        backend.play();

        let mut out = StereoBuffer::silence(1024);
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(5));
            source.pull(&mut out);
            // Everything the worker renders at zero gain is silent
            assert_eq!(out.peak(), 0.0);
        }
        backend.destroy();
    }
}
