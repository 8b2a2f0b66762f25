//! Shared position record - fixed-layout telemetry for the polling backend
//!
//! The shared-memory worker publishes position/VU data through a fixed
//! 164-byte little-endian record that the orchestrator polls on a wall-clock
//! timer. The byte layout is a wire contract:
//!
//! ```text
//! positionMs:   f64     @ 0
//! currentRow:   i32     @ 8    (-1 = module ended)
//! currentPat:   i32     @ 12
//! currentOrder: i32     @ 16
//! (padding)             @ 20
//! bpm:          f64     @ 24
//! numChannels:  i32     @ 32
//! channelVU:    f32[32] @ 36
//! ```
//!
//! There is no torn-read protection: writer and reader touch the region
//! word-by-word with relaxed atomics, so a poll may observe a half-written
//! record. Readers validate every scalar field and treat anything
//! out-of-range as "no update this poll".

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::MAX_VU_CHANNELS;

/// Total record length in bytes (36-byte header + 32 * 4 VU bytes)
pub const RECORD_LEN: usize = 164;

/// Sentinel in `row` meaning the module has played to its end
pub const ROW_ENDED: i32 = -1;

const OFFSET_POSITION_MS: usize = 0;
const OFFSET_ROW: usize = 8;
const OFFSET_PATTERN: usize = 12;
const OFFSET_ORDER: usize = 16;
const OFFSET_BPM: usize = 24;
const OFFSET_NUM_CHANNELS: usize = 32;
const OFFSET_CHANNEL_VU: usize = 36;

/// Upper bound accepted for `row`/`pattern`/`order` when validating a poll.
/// Far beyond any real module; only rejects half-written garbage.
const MAX_INDEX: i32 = 4096;

/// Upper bound accepted for `bpm` when validating a poll
const MAX_BPM: f64 = 1000.0;

/// One decoded snapshot of the shared record
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub position_ms: f64,
    pub row: i32,
    pub pattern: i32,
    pub order: i32,
    pub bpm: f64,
    pub num_channels: i32,
    pub channel_vu: [f32; MAX_VU_CHANNELS],
}

impl Default for PositionRecord {
    fn default() -> Self {
        Self {
            position_ms: 0.0,
            row: 0,
            pattern: 0,
            order: 0,
            bpm: 0.0,
            num_channels: 0,
            channel_vu: [0.0; MAX_VU_CHANNELS],
        }
    }
}

impl PositionRecord {
    /// Whether this snapshot carries the end-of-module sentinel
    pub fn ended(&self) -> bool {
        self.row == ROW_ENDED
    }

    /// Serialize into the fixed little-endian layout
    pub fn encode(&self, out: &mut [u8; RECORD_LEN]) {
        out.fill(0);
        out[OFFSET_POSITION_MS..OFFSET_POSITION_MS + 8]
            .copy_from_slice(&self.position_ms.to_le_bytes());
        out[OFFSET_ROW..OFFSET_ROW + 4].copy_from_slice(&self.row.to_le_bytes());
        out[OFFSET_PATTERN..OFFSET_PATTERN + 4].copy_from_slice(&self.pattern.to_le_bytes());
        out[OFFSET_ORDER..OFFSET_ORDER + 4].copy_from_slice(&self.order.to_le_bytes());
        out[OFFSET_BPM..OFFSET_BPM + 8].copy_from_slice(&self.bpm.to_le_bytes());
        out[OFFSET_NUM_CHANNELS..OFFSET_NUM_CHANNELS + 4]
            .copy_from_slice(&self.num_channels.to_le_bytes());
        for (i, vu) in self.channel_vu.iter().enumerate() {
            let at = OFFSET_CHANNEL_VU + i * 4;
            out[at..at + 4].copy_from_slice(&vu.to_le_bytes());
        }
    }

    /// Deserialize from the fixed little-endian layout (no validation)
    pub fn decode(bytes: &[u8; RECORD_LEN]) -> Self {
        let f64_at = |at: usize| {
            f64::from_le_bytes(bytes[at..at + 8].try_into().expect("fixed slice"))
        };
        let i32_at = |at: usize| {
            i32::from_le_bytes(bytes[at..at + 4].try_into().expect("fixed slice"))
        };

        let mut channel_vu = [0.0f32; MAX_VU_CHANNELS];
        for (i, vu) in channel_vu.iter_mut().enumerate() {
            let at = OFFSET_CHANNEL_VU + i * 4;
            *vu = f32::from_le_bytes(bytes[at..at + 4].try_into().expect("fixed slice"));
        }

        Self {
            position_ms: f64_at(OFFSET_POSITION_MS),
            row: i32_at(OFFSET_ROW),
            pattern: i32_at(OFFSET_PATTERN),
            order: i32_at(OFFSET_ORDER),
            bpm: f64_at(OFFSET_BPM),
            num_channels: i32_at(OFFSET_NUM_CHANNELS),
            channel_vu,
        }
    }

    /// Range-check every scalar field; returns the record with VU levels
    /// clamped, or None if any field could only come from a torn or
    /// not-yet-published write.
    fn validated(mut self) -> Option<Self> {
        if !self.position_ms.is_finite() || self.position_ms < 0.0 {
            return None;
        }
        if self.row < ROW_ENDED || self.row >= MAX_INDEX {
            return None;
        }
        if self.pattern < 0 || self.pattern >= MAX_INDEX {
            return None;
        }
        if self.order < 0 || self.order >= MAX_INDEX {
            return None;
        }
        if !self.bpm.is_finite() || self.bpm < 0.0 || self.bpm > MAX_BPM {
            return None;
        }
        // num_channels == 0 means the worker has not published yet
        if self.num_channels <= 0 || self.num_channels > MAX_VU_CHANNELS as i32 {
            return None;
        }
        for vu in &mut self.channel_vu {
            *vu = if vu.is_finite() {
                vu.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        Some(self)
    }
}

/// The shared telemetry region itself.
///
/// Stored as relaxed atomic words so writer (worker thread) and reader
/// (orchestrator poll) never need a lock; word-level atomicity is all the
/// contract provides, tearing across words is handled by validation.
pub struct SharedPositionRecord {
    words: [AtomicU32; RECORD_LEN / 4],
}

impl SharedPositionRecord {
    pub fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Publish a snapshot (worker side)
    pub fn write(&self, record: &PositionRecord) {
        let mut buf = [0u8; RECORD_LEN];
        record.encode(&mut buf);
        for (word, chunk) in self.words.iter().zip(buf.chunks_exact(4)) {
            let value = u32::from_le_bytes(chunk.try_into().expect("fixed chunk"));
            word.store(value, Ordering::Relaxed);
        }
    }

    /// Poll the region (orchestrator side); None when nothing valid has
    /// been published since the last clear
    pub fn read(&self) -> Option<PositionRecord> {
        let mut buf = [0u8; RECORD_LEN];
        for (word, chunk) in self.words.iter().zip(buf.chunks_exact_mut(4)) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        PositionRecord::decode(&buf).validated()
    }

    /// Zero the region (reads return None until the next write)
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SharedPositionRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PositionRecord {
        let mut channel_vu = [0.0f32; MAX_VU_CHANNELS];
        channel_vu[0] = 0.5;
        channel_vu[3] = 1.0;
        PositionRecord {
            position_ms: 1234.5,
            row: 17,
            pattern: 3,
            order: 2,
            bpm: 125.0,
            num_channels: 4,
            channel_vu,
        }
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = [0u8; RECORD_LEN];
        sample_record().encode(&mut buf);

        assert_eq!(f64::from_le_bytes(buf[0..8].try_into().unwrap()), 1234.5);
        assert_eq!(i32::from_le_bytes(buf[8..12].try_into().unwrap()), 17);
        assert_eq!(i32::from_le_bytes(buf[12..16].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(buf[16..20].try_into().unwrap()), 2);
        // Alignment padding stays zeroed
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]);
        assert_eq!(f64::from_le_bytes(buf[24..32].try_into().unwrap()), 125.0);
        assert_eq!(i32::from_le_bytes(buf[32..36].try_into().unwrap()), 4);
        assert_eq!(f32::from_le_bytes(buf[36..40].try_into().unwrap()), 0.5);
        assert_eq!(f32::from_le_bytes(buf[48..52].try_into().unwrap()), 1.0);

        assert_eq!(PositionRecord::decode(&buf), sample_record());
    }

    #[test]
    fn test_shared_region_roundtrip() {
        let shared = SharedPositionRecord::new();
        assert_eq!(shared.read(), None);

        shared.write(&sample_record());
        assert_eq!(shared.read(), Some(sample_record()));

        shared.clear();
        assert_eq!(shared.read(), None);
    }

    #[test]
    fn test_ended_sentinel() {
        let shared = SharedPositionRecord::new();
        let mut record = sample_record();
        record.row = ROW_ENDED;
        shared.write(&record);

        let polled = shared.read().expect("sentinel record is valid");
        assert!(polled.ended());
    }

    #[test]
    fn test_out_of_range_fields_read_as_no_update() {
        let shared = SharedPositionRecord::new();

        let mut record = sample_record();
        record.row = -2;
        shared.write(&record);
        assert_eq!(shared.read(), None);

        let mut record = sample_record();
        record.bpm = f64::NAN;
        shared.write(&record);
        assert_eq!(shared.read(), None);

        let mut record = sample_record();
        record.num_channels = 99;
        shared.write(&record);
        assert_eq!(shared.read(), None);
    }

    #[test]
    fn test_vu_levels_clamped_not_rejected() {
        let shared = SharedPositionRecord::new();
        let mut record = sample_record();
        record.channel_vu[1] = 7.5;
        record.channel_vu[2] = f32::NAN;
        shared.write(&record);

        let polled = shared.read().expect("scalar fields are in range");
        assert_eq!(polled.channel_vu[1], 1.0);
        assert_eq!(polled.channel_vu[2], 0.0);
    }
}
