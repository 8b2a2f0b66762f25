//! Sample sources - how the audio thread pulls frames from a backend
//!
//! Every backend ultimately hands the playback engine one [`SampleSource`].
//! For the sync-pull backend the source renders straight from the decoder
//! inside the audio callback; the worker backends hand over a [`RingSource`]
//! that drains a lock-free ring filled by their worker thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chipdeck_core::{StereoBuffer, StereoSample};

/// Produces stereo frames for the audio thread.
///
/// `pull` must fill the whole buffer (silence where no audio is available)
/// and must be real-time safe: no allocation, no blocking.
pub trait SampleSource: Send {
    fn pull(&mut self, out: &mut StereoBuffer);
}

/// Transport state shared between a worker backend handle, its worker
/// thread, and its ring source. Relaxed ordering throughout; only
/// visibility is needed.
#[derive(Debug, Default)]
pub struct WorkerShared {
    /// Gates the ring source: when false the source outputs silence without
    /// consuming buffered frames, so pause takes effect within one quantum
    /// even though the ring may hold pre-pause audio.
    pub playing: AtomicBool,
    /// Count of pulls that found the ring short of a full quantum
    pub underruns: AtomicU32,
}

/// Drains a worker's audio ring, substituting silence on starvation
pub struct RingSource {
    consumer: rtrb::Consumer<StereoSample>,
    shared: Arc<WorkerShared>,
}

impl RingSource {
    pub fn new(consumer: rtrb::Consumer<StereoSample>, shared: Arc<WorkerShared>) -> Self {
        Self { consumer, shared }
    }
}

impl SampleSource for RingSource {
    fn pull(&mut self, out: &mut StereoBuffer) {
        if !self.shared.playing.load(Ordering::Relaxed) {
            out.fill_silence();
            return;
        }

        let mut starved = false;
        for sample in out.as_mut_slice() {
            match self.consumer.pop() {
                Ok(frame) => *sample = frame,
                Err(_) => {
                    *sample = StereoSample::silence();
                    starved = true;
                }
            }
        }
        if starved {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_source_drains_and_starves() {
        let (mut producer, consumer) = rtrb::RingBuffer::<StereoSample>::new(8);
        let shared = Arc::new(WorkerShared::default());
        shared.playing.store(true, Ordering::Relaxed);
        let mut source = RingSource::new(consumer, Arc::clone(&shared));

        for i in 0..4 {
            producer.push(StereoSample::new(i as f32, 0.0)).unwrap();
        }

        let mut out = StereoBuffer::silence(6);
        source.pull(&mut out);
        assert_eq!(out[0].left, 0.0);
        assert_eq!(out[3].left, 3.0);
        assert_eq!(out[4], StereoSample::silence());
        assert_eq!(shared.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_paused_source_keeps_buffered_audio() {
        let (mut producer, consumer) = rtrb::RingBuffer::<StereoSample>::new(8);
        let shared = Arc::new(WorkerShared::default());
        let mut source = RingSource::new(consumer, Arc::clone(&shared));

        producer.push(StereoSample::new(1.0, 1.0)).unwrap();

        let mut out = StereoBuffer::silence(2);
        source.pull(&mut out);
        assert_eq!(out[0], StereoSample::silence());

        // Resume: the buffered frame is still there
        shared.playing.store(true, Ordering::Relaxed);
        source.pull(&mut out);
        assert_eq!(out[0], StereoSample::new(1.0, 1.0));
    }
}
