//! Playback engine - the audio-thread side of the command pattern
//!
//! Owned exclusively by the audio callback (or by a test pumping it
//! manually). Holds the active sample source and the shared mix stage;
//! exactly one source is installed at a time, so two backends can never
//! write into the mix stage concurrently.

use chipdeck_core::mix::MixStage;
use chipdeck_core::StereoBuffer;

use crate::command::{CommandReceiver, EngineCommand};
use crate::source::SampleSource;

/// The audio-thread playback engine
pub struct PlaybackEngine {
    source: Option<Box<dyn SampleSource>>,
    mix: MixStage,
}

impl PlaybackEngine {
    pub fn new() -> Self {
        Self {
            source: None,
            mix: MixStage::new(),
        }
    }

    /// Whether a source is currently installed
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Drain and apply all pending commands (wait-free)
    pub fn process_commands(&mut self, rx: &mut CommandReceiver) {
        while let Ok(cmd) = rx.pop() {
            match cmd {
                EngineCommand::SwapSource(source) => self.source = Some(source),
                EngineCommand::ClearSource => self.source = None,
                EngineCommand::SetGain(gain) => self.mix.set_gain(gain),
                EngineCommand::SetPan(pan) => self.mix.set_pan(pan),
                EngineCommand::SetGainBypass(bypass) => self.mix.set_gain_bypass(bypass),
            }
        }
    }

    /// Fill one buffer of mixed output
    pub fn process(&mut self, out: &mut StereoBuffer) {
        match &mut self.source {
            Some(source) => source.pull(out),
            None => out.fill_silence(),
        }
        self.mix.process(out);
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new()
    }
}
