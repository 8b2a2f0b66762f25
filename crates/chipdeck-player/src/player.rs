//! Player - the orchestrator and UI consumption surface
//!
//! Owns the active backend, the fallback/selection policy, the pattern
//! cache, and all control routing (seek/loop/volume/pan). Runs entirely on
//! the control thread; audio flows through the [`crate::engine`] command
//! ring, state comes back via backend reports which `poll()` ingests on the
//! embedder's display cadence.
//!
//! State machine: `NoModule -> Loading -> Stopped <-> Playing <-> Paused`,
//! with `Loading` re-entered on every load. A failed load leaves the prior
//! module (and state) untouched.

use std::collections::HashSet;
use std::sync::Arc;

use chipdeck_core::decoder::{DecodeError, DecoderFactory, ModuleMetadata};
use chipdeck_core::pattern::{PatternCache, PatternMatrix};
use chipdeck_core::{BackendKind, MAX_VU_CHANNELS};

use crate::backend::ActiveBackend;
use crate::command::{CommandSender, EngineCommand};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::sync::{DisplayPosition, PositionSynchronizer};

/// Composite orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    NoModule,
    Loading,
    Stopped,
    Playing,
    Paused,
}

/// Everything derived from one successful load
struct LoadedModule {
    bytes: Arc<Vec<u8>>,
    metadata: ModuleMetadata,
    cache: PatternCache,
}

/// The playback orchestrator
pub struct Player {
    factory: Arc<dyn DecoderFactory>,
    config: EngineConfig,
    commands: CommandSender,
    sample_rate: u32,
    state: PlayerState,
    backend: Option<ActiveBackend>,
    /// Kinds that failed `initialize` (or were disabled); skipped for the
    /// rest of the session
    unavailable: HashSet<BackendKind>,
    /// The kind selection starts from; remembered across loads and updated
    /// by explicit cycling
    preferred: Option<BackendKind>,
    module: Option<LoadedModule>,
    sync: PositionSynchronizer,
    /// Position to restore on the next backend activation (engine switch,
    /// or a seek issued while no backend is up)
    resume: Option<(usize, usize)>,
    looping: bool,
    volume: f32,
    pan: f32,
    status: String,
    vu: [f32; MAX_VU_CHANNELS],
    bpm: f64,
}

impl Player {
    /// Create an orchestrator wired to a playback engine via `commands`.
    ///
    /// `sample_rate` is the rate of the output the engine feeds (from
    /// [`crate::audio::start_audio_system`], or chosen freely in tests).
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        config: EngineConfig,
        commands: CommandSender,
        sample_rate: u32,
    ) -> Self {
        Self {
            factory,
            config,
            commands,
            sample_rate,
            state: PlayerState::NoModule,
            backend: None,
            unavailable: HashSet::new(),
            preferred: None,
            module: None,
            sync: PositionSynchronizer::new(),
            resume: None,
            looping: false,
            volume: 1.0,
            pan: 0.0,
            status: "No module loaded".into(),
            vu: [0.0; MAX_VU_CHANNELS],
            bpm: 0.0,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Load a module from raw bytes.
    ///
    /// Validates the bytes and builds the pattern cache before touching the
    /// current playback state, so a malformed stream leaves any prior
    /// module active. On success the previous backend is stopped and
    /// destroyed and the player lands in `Stopped`.
    pub fn load(&mut self, bytes: Vec<u8>) -> Result<ModuleMetadata, DecodeError> {
        let prior_state = self.state;
        self.state = PlayerState::Loading;
        self.status = "Loading…".into();

        let decoder = match self.factory.create(&bytes) {
            Ok(decoder) => decoder,
            Err(e) => {
                self.state = prior_state;
                self.status = format!("Error: {e}");
                return Err(e);
            }
        };

        // Stop first, then unload
        self.teardown_backend();

        let cache = PatternCache::build(decoder.as_ref());
        let metadata = decoder.metadata();
        drop(decoder);

        log::info!(
            "loaded module \"{}\" ({} orders, {} channels)",
            metadata.title,
            metadata.num_orders,
            metadata.num_channels
        );

        self.bpm = metadata.initial_bpm;
        self.status = if metadata.title.is_empty() {
            "Module loaded".into()
        } else {
            format!("Loaded: {}", metadata.title)
        };
        self.module = Some(LoadedModule {
            bytes: Arc::new(bytes),
            metadata: metadata.clone(),
            cache,
        });
        self.sync = PositionSynchronizer::new();
        self.resume = None;
        self.vu = [0.0; MAX_VU_CHANNELS];
        self.state = PlayerState::Stopped;
        Ok(metadata)
    }

    // ── Transport ────────────────────────────────────────────────────────

    /// Start or resume playback, selecting a backend on first use
    pub fn play(&mut self) -> EngineResult<()> {
        if self.module.is_none() {
            log::warn!("play() with no module loaded");
            return Err(EngineError::NotInitialized);
        }
        if self.state == PlayerState::Playing {
            return Ok(());
        }
        self.ensure_backend()?;
        if let Some(backend) = &mut self.backend {
            backend.play();
        }
        self.state = PlayerState::Playing;
        self.status = "Playing…".into();
        Ok(())
    }

    /// Pause playback (idempotent)
    pub fn pause(&mut self) {
        if let Some(backend) = &mut self.backend {
            backend.pause();
        }
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
            self.status = "Paused".into();
        }
    }

    /// Stop playback and rewind to the start
    pub fn stop(&mut self) {
        if self.module.is_none() {
            return;
        }
        if let Some(backend) = &mut self.backend {
            backend.pause();
            backend.seek(0, 0);
        }
        self.rewind_display();
        self.state = PlayerState::Stopped;
        self.status = "Stopped".into();
    }

    /// Seek to an absolute row index across the whole play sequence.
    ///
    /// Out-of-range targets clamp (negative to the first row, past-the-end
    /// to the last). The displayed order/row updates immediately; the
    /// backend's next report re-synchronizes time.
    pub fn seek(&mut self, absolute_row: i64) {
        let Some(module) = &self.module else {
            log::warn!("seek() with no module loaded");
            return;
        };
        let (order, row) = module.cache.resolve_row(absolute_row);

        let shown = self.position();
        let clock = self
            .backend
            .as_ref()
            .map(|b| b.clock_seconds())
            .unwrap_or(0.0);
        self.sync.force(order, row, shown.time_seconds, clock);

        match &mut self.backend {
            Some(backend) => backend.seek(order, row),
            None => self.resume = Some((order, row)),
        }
    }

    /// Loop policy applied when the module ends; identical for every
    /// backend because the decision is made here, not in the backend
    pub fn set_loop(&mut self, enabled: bool) {
        self.looping = enabled;
    }

    /// Master volume (0.0..=1.0).
    ///
    /// Routed to the mix stage, except while the shared-memory backend is
    /// active: that backend applies gain internally, so the value is pushed
    /// into the worker (keeping it from going stale) and the mix-stage gain
    /// stays bypassed.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        let volume = self.volume;
        let shm_active = self
            .backend
            .as_ref()
            .is_some_and(|b| b.kind() == BackendKind::SharedMemoryWorker);
        if shm_active {
            if let Some(backend) = &mut self.backend {
                backend.set_volume(volume);
            }
        } else {
            self.send_command(EngineCommand::SetGain(volume));
        }
    }

    /// Stereo pan (-1.0..=1.0), always applied at the mix stage
    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
        self.send_command(EngineCommand::SetPan(self.pan));
    }

    /// Switch to the next available backend kind.
    ///
    /// Cycling while playing tears the current backend down completely,
    /// then restarts the new one from the same order/row (best-effort row
    /// resume, not sample resume). Never leaves two backends active.
    pub fn cycle_backend(&mut self) -> EngineResult<()> {
        let current = self
            .backend
            .as_ref()
            .map(|b| b.kind())
            .or(self.preferred)
            .unwrap_or(BackendKind::PREFERENCE[0]);

        let mut next = current.next();
        while next != current && self.unavailable.contains(&next) {
            next = next.next();
        }
        if next == current {
            log::info!("no other backend kind available to cycle to");
            return Ok(());
        }

        let was_playing = self.state == PlayerState::Playing;
        if self.backend.is_some() {
            let shown = self.position();
            self.resume = Some((shown.order, shown.row));
            self.teardown_backend();
        }
        self.preferred = Some(next);
        log::info!("cycling backend to {next}");

        if was_playing {
            self.state = PlayerState::Paused;
            self.play()?;
        }
        Ok(())
    }

    /// Mark a backend kind available/unavailable for selection.
    ///
    /// Disabling the active kind takes effect on the next selection; kinds
    /// that fail `initialize` are marked unavailable automatically.
    pub fn set_backend_enabled(&mut self, kind: BackendKind, enabled: bool) {
        if enabled {
            self.unavailable.remove(&kind);
        } else {
            self.unavailable.insert(kind);
        }
    }

    // ── Display-cadence tick ─────────────────────────────────────────────

    /// Ingest backend reports and apply end-of-module / error policy.
    ///
    /// Call on the UI's display cadence (~60 Hz); this is also the poll
    /// timer for the shared-memory record.
    pub fn poll(&mut self) {
        let Some(backend) = &mut self.backend else {
            return;
        };
        backend.poll();

        if let Some(report) = backend.latest_report() {
            self.sync.observe(report);
        }
        self.vu = backend.vu();
        let bpm = backend.bpm();
        if bpm > 0.0 {
            self.bpm = bpm;
        }

        // A backend failing while playing pauses; it never crashes the session
        if let Some(message) = backend.take_error() {
            backend.pause();
            log::error!("backend error: {message}");
            if self.state == PlayerState::Playing {
                self.state = PlayerState::Paused;
            }
            self.status = format!("Error: {message}");
            return;
        }

        if backend.take_ended() {
            if self.looping {
                backend.seek(0, 0);
                let clock = backend.clock_seconds();
                self.sync.force(0, 0, 0.0, clock);
            } else {
                backend.pause();
                backend.seek(0, 0);
                self.rewind_display();
                self.state = PlayerState::Stopped;
                self.status = "Finished".into();
            }
        }
    }

    // ── Reactive reads ───────────────────────────────────────────────────

    /// The current playback position, extrapolated between reports while
    /// playing and frozen otherwise
    pub fn position(&self) -> DisplayPosition {
        let shown = match (&self.state, &self.backend) {
            (PlayerState::Playing, Some(backend)) => self.sync.displayed(backend.clock_seconds()),
            _ => self.sync.current(),
        };
        shown.unwrap_or_default()
    }

    /// Pattern matrix for the order currently displayed; None means "no
    /// pattern data", never an error
    pub fn current_pattern(&self) -> Option<&PatternMatrix> {
        let order = self.position().order;
        self.module.as_ref()?.cache.get(order)
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Human-readable status, always kept current
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn metadata(&self) -> Option<&ModuleMetadata> {
        self.module.as_ref().map(|m| &m.metadata)
    }

    pub fn pattern_cache(&self) -> Option<&PatternCache> {
        self.module.as_ref().map(|m| &m.cache)
    }

    /// Per-channel VU levels as of the last poll
    pub fn vu_levels(&self) -> &[f32; MAX_VU_CHANNELS] {
        &self.vu
    }

    /// Current estimated tempo
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn loop_enabled(&self) -> bool {
        self.looping
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    /// Audio-ring underruns observed by the active backend's source
    pub fn underruns(&self) -> u32 {
        self.backend.as_ref().map(|b| b.underruns()).unwrap_or(0)
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Select, initialize, and load a backend if none is active.
    ///
    /// Walks the capability-preference order starting from the remembered
    /// kind; a failed `initialize` marks that kind unavailable for the
    /// session and selection falls through to the next.
    fn ensure_backend(&mut self) -> EngineResult<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let bytes = Arc::clone(
            &self
                .module
                .as_ref()
                .ok_or(EngineError::NotInitialized)?
                .bytes,
        );

        for kind in self.selection_order() {
            if self.unavailable.contains(&kind) {
                continue;
            }
            let mut backend = ActiveBackend::create(kind, Arc::clone(&self.factory), &self.config);
            if let Err(e) = backend.initialize(self.sample_rate) {
                log::warn!("backend {kind} unavailable: {e}; falling back");
                self.unavailable.insert(kind);
                continue;
            }
            if let Err(e) = backend.load_module(&bytes) {
                // Load failures (e.g. a worker that stopped acknowledging)
                // are retryable; the kind stays available
                backend.destroy();
                self.status = format!("Error: {e}");
                return Err(e);
            }

            if let Some((order, row)) = self.resume.take() {
                backend.seek(order, row);
            }
            match backend.take_source() {
                Some(source) => self.send_command(EngineCommand::SwapSource(source)),
                None => log::warn!("backend {kind} produced no sample source"),
            }

            // Volume routing: exactly one gain application on every path
            if kind == BackendKind::SharedMemoryWorker {
                backend.set_volume(self.volume);
                self.send_command(EngineCommand::SetGainBypass(true));
            } else {
                self.send_command(EngineCommand::SetGain(self.volume));
                self.send_command(EngineCommand::SetGainBypass(false));
            }
            self.send_command(EngineCommand::SetPan(self.pan));

            self.sync.reset(backend.report_mode());
            self.preferred = Some(kind);
            log::info!("selected {kind} backend");
            self.backend = Some(backend);
            return Ok(());
        }

        self.status = "Error: no audio backend available".into();
        Err(EngineError::InitFailed("all backend kinds unavailable".into()))
    }

    /// Preference order rotated to start at the remembered kind
    fn selection_order(&self) -> Vec<BackendKind> {
        let mut order = BackendKind::PREFERENCE.to_vec();
        if let Some(preferred) = self.preferred {
            if let Some(idx) = order.iter().position(|k| *k == preferred) {
                order.rotate_left(idx);
            }
        }
        order
    }

    /// Stop, unhook from the mix stage, and destroy the active backend
    fn teardown_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.pause();
            self.send_command(EngineCommand::ClearSource);
            backend.destroy();
        }
    }

    /// Snap the displayed position back to the origin
    fn rewind_display(&mut self) {
        let clock = self
            .backend
            .as_ref()
            .map(|b| b.clock_seconds())
            .unwrap_or(0.0);
        self.sync.force(0, 0, 0.0, clock);
    }

    fn send_command(&mut self, cmd: EngineCommand) {
        if self.commands.send(cmd).is_err() {
            log::error!("engine command queue full; command dropped");
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.teardown_backend();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::command_channel;
    use chipdeck_core::decoder::fixture::FixtureDecoderFactory;

    fn bare_player() -> Player {
        let (sender, _rx) = command_channel();
        Player::new(
            Arc::new(FixtureDecoderFactory),
            EngineConfig::default(),
            sender,
            44_100,
        )
    }

    #[test]
    fn test_selection_order_rotation() {
        let mut player = bare_player();
        assert_eq!(player.selection_order(), BackendKind::PREFERENCE.to_vec());

        player.preferred = Some(BackendKind::SyncPull);
        assert_eq!(
            player.selection_order(),
            vec![
                BackendKind::SyncPull,
                BackendKind::SharedMemoryWorker,
                BackendKind::MessageWorker,
            ]
        );
    }

    #[test]
    fn test_play_without_module_is_logged_error() {
        let mut player = bare_player();
        assert_eq!(player.play(), Err(EngineError::NotInitialized));
        assert_eq!(player.state(), PlayerState::NoModule);
    }

    #[test]
    fn test_invalid_load_keeps_prior_state() {
        let mut player = bare_player();
        assert_eq!(
            player.load(b"garbage".to_vec()),
            Err(DecodeError::InvalidFormat)
        );
        assert_eq!(player.state(), PlayerState::NoModule);
        assert!(player.status().starts_with("Error:"));
    }
}
