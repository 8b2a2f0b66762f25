//! Lock-free command queue for the audio-thread playback engine
//!
//! The control thread sends commands via a wait-free SPSC ring; the audio
//! thread processes them at frame boundaries. A failed mutex grab in an
//! audio callback means an audible dropout, so no path between the
//! orchestrator and the engine ever locks.

use crate::source::SampleSource;

/// Commands sent from the control thread to the audio thread
pub enum EngineCommand {
    /// Install a new active source, replacing (and dropping) any current one.
    ///
    /// Boxed so the command itself stays pointer-sized in the ring.
    SwapSource(Box<dyn SampleSource>),
    /// Remove the active source; the engine outputs silence
    ClearSource,
    /// Set mix-stage gain (0.0..=1.0)
    SetGain(f32),
    /// Set mix-stage stereo pan (-1.0..=1.0)
    SetPan(f32),
    /// Bypass mix-stage gain while the active backend applies gain itself
    SetGainBypass(bool),
}

/// Capacity of the command queue.
///
/// Orchestrator traffic is sparse (a handful of commands per user action);
/// 64 slots is ample headroom.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Receive side of the command queue, owned by whatever owns the
/// [`crate::engine::PlaybackEngine`] (the audio callback, or a test pumping
/// the engine manually)
pub type CommandReceiver = rtrb::Consumer<EngineCommand>;

/// Create a new command channel (sender/receiver pair)
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (producer, consumer) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    (CommandSender { producer }, consumer)
}

/// Send side of the command queue, owned by the orchestrator
pub struct CommandSender {
    pub(crate) producer: rtrb::Producer<EngineCommand>,
}

impl CommandSender {
    pub fn new(producer: rtrb::Producer<EngineCommand>) -> Self {
        Self { producer }
    }

    /// Send a command (non-blocking).
    ///
    /// Returns `Err(cmd)` if the queue is full (command is returned).
    pub fn send(&mut self, cmd: EngineCommand) -> Result<(), EngineCommand> {
        self.producer.push(cmd).map_err(|e| match e {
            rtrb::PushError::Full(value) => value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_roundtrip() {
        let (mut sender, mut rx) = command_channel();

        sender.send(EngineCommand::SetGain(0.5)).ok().unwrap();
        assert!(matches!(rx.pop().unwrap(), EngineCommand::SetGain(g) if g == 0.5));
        assert!(rx.pop().is_err());
    }
}
