//! Fixture module format - a deterministic decoder for tests and demos
//!
//! A tiny binary container that exercises every part of the decoder adapter
//! contract without pulling in a real tracker-decoding library: magic-checked
//! load, order/pattern/row/cell queries, per-channel VU, seek, repeat, and
//! the end-of-module render signal. Audio is synthesized as one decaying
//! sine voice per channel, panned alternately left/right.
//!
//! Layout (all single-byte fields):
//!
//! ```text
//! magic "CKMF" | version | channels | orders | patterns | bpm
//! title_len | title bytes
//! order table: `orders` pattern indices
//! per pattern: num_rows, then rows x channels cells of 6 bytes
//!              [note, instrument, vol_cmd, vol_val, eff_cmd, eff_val]
//! ```

use super::{
    CellField, DecodeError, DecoderFactory, DecoderPosition, ModuleDecoder, ModuleMetadata,
};
use crate::types::MAX_VU_CHANNELS;

const MAGIC: &[u8; 4] = b"CKMF";
const VERSION: u8 = 1;

/// Rows per beat used to derive row duration from BPM
const ROWS_PER_BEAT: f64 = 4.0;

/// Voice amplitude decay time constant in seconds
const DECAY_SECONDS: f64 = 0.3;

/// One pattern's cell grid
#[derive(Debug, Clone)]
struct Pattern {
    num_rows: usize,
    /// Row-major: cells[row * channels + channel]
    cells: Vec<[u8; 6]>,
}

impl Pattern {
    fn cell(&self, row: usize, channel: usize, channels: usize) -> Option<&[u8; 6]> {
        if row >= self.num_rows || channel >= channels {
            return None;
        }
        self.cells.get(row * channels + channel)
    }
}

/// Per-channel synthesis state
#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    freq: f64,
    phase: f64,
    env: f32,
}

/// Decoder over the fixture container format
#[derive(Debug)]
pub struct FixtureDecoder {
    title: String,
    channels: usize,
    bpm: f64,
    order_table: Vec<usize>,
    patterns: Vec<Pattern>,
    total_rows: usize,

    // Playback state
    order: usize,
    row: usize,
    abs_row: usize,
    row_elapsed: f64,
    needs_latch: bool,
    ended: bool,
    repeat: bool,
    voices: Vec<Voice>,
}

/// Byte-stream cursor for parsing
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::InvalidFormat)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::InvalidFormat)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::InvalidFormat)?;
        self.pos = end;
        Ok(slice)
    }
}

impl FixtureDecoder {
    /// Parse a fixture container; fails with `InvalidFormat` on anything
    /// that is not a well-formed fixture byte stream.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cur = Cursor { bytes, pos: 0 };

        if cur.take(4)? != MAGIC || cur.u8()? != VERSION {
            return Err(DecodeError::InvalidFormat);
        }

        let channels = cur.u8()? as usize;
        let num_orders = cur.u8()? as usize;
        let num_patterns = cur.u8()? as usize;
        let bpm = cur.u8()? as f64;
        if channels == 0 || channels > MAX_VU_CHANNELS || num_orders == 0 || num_patterns == 0 {
            return Err(DecodeError::InvalidFormat);
        }
        if bpm == 0.0 {
            return Err(DecodeError::InvalidFormat);
        }

        let title_len = cur.u8()? as usize;
        let title = String::from_utf8_lossy(cur.take(title_len)?).into_owned();

        let mut order_table = Vec::with_capacity(num_orders);
        for &entry in cur.take(num_orders)? {
            if entry as usize >= num_patterns {
                return Err(DecodeError::InvalidFormat);
            }
            order_table.push(entry as usize);
        }

        let mut patterns = Vec::with_capacity(num_patterns);
        for _ in 0..num_patterns {
            let num_rows = cur.u8()? as usize;
            if num_rows == 0 {
                return Err(DecodeError::InvalidFormat);
            }
            let raw = cur.take(num_rows * channels * 6)?;
            let cells = raw
                .chunks_exact(6)
                .map(|c| [c[0], c[1], c[2], c[3], c[4], c[5]])
                .collect();
            patterns.push(Pattern { num_rows, cells });
        }

        let total_rows = order_table
            .iter()
            .map(|&p| patterns[p].num_rows)
            .sum::<usize>();

        Ok(Self {
            title,
            channels,
            bpm,
            order_table,
            patterns,
            total_rows,
            order: 0,
            row: 0,
            abs_row: 0,
            row_elapsed: 0.0,
            needs_latch: true,
            ended: false,
            repeat: false,
            voices: vec![Voice::default(); channels],
        })
    }

    fn row_seconds(&self) -> f64 {
        60.0 / (self.bpm * ROWS_PER_BEAT)
    }

    fn current_pattern(&self) -> &Pattern {
        &self.patterns[self.order_table[self.order]]
    }

    /// Latch the current row's notes into the channel voices
    fn latch_row(&mut self) {
        let pattern_idx = self.order_table[self.order];
        for ch in 0..self.channels {
            let cell = self.patterns[pattern_idx]
                .cell(self.row, ch, self.channels)
                .copied()
                .unwrap_or_default();
            let note = cell[0];
            if note > 0 {
                // Equal-tempered pitch, note 69 = A440
                let voice = &mut self.voices[ch];
                voice.freq = 440.0 * 2f64.powf((note as f64 - 69.0) / 12.0);
                voice.phase = 0.0;
                let vol = cell[3];
                voice.env = if vol > 0 {
                    (vol as f32 / 64.0).min(1.0)
                } else {
                    0.8
                };
            }
        }
        self.needs_latch = false;
    }

    /// Advance to the next row; returns false when the module ends
    fn advance_row(&mut self) -> bool {
        self.abs_row += 1;
        self.row += 1;
        if self.row >= self.current_pattern().num_rows {
            self.row = 0;
            self.order += 1;
            if self.order >= self.order_table.len() {
                if self.repeat {
                    self.order = 0;
                    self.abs_row = 0;
                } else {
                    self.order = self.order_table.len() - 1;
                    self.row = self.current_pattern().num_rows - 1;
                    self.abs_row = self.total_rows.saturating_sub(1);
                    return false;
                }
            }
        }
        self.needs_latch = true;
        true
    }
}

impl ModuleDecoder for FixtureDecoder {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            title: self.title.clone(),
            num_orders: self.order_table.len(),
            num_patterns: self.patterns.len(),
            num_channels: self.channels,
            duration_seconds: self.total_rows as f64 * self.row_seconds(),
            initial_bpm: self.bpm,
        }
    }

    fn render_stereo(&mut self, sample_rate: u32, left: &mut [f32], right: &mut [f32]) -> usize {
        debug_assert_eq!(left.len(), right.len());
        if self.ended || sample_rate == 0 {
            return 0;
        }

        let dt = 1.0 / sample_rate as f64;
        let decay = (-dt / DECAY_SECONDS).exp() as f32;
        let master = 1.0 / self.channels as f32;
        let row_seconds = self.row_seconds();

        let mut written = 0;
        for frame in 0..left.len() {
            if self.needs_latch {
                self.latch_row();
            }

            let mut l = 0.0f32;
            let mut r = 0.0f32;
            for (ch, voice) in self.voices.iter_mut().enumerate() {
                if voice.env > 1e-4 {
                    let s = (voice.phase * std::f64::consts::TAU).sin() as f32 * voice.env;
                    voice.phase = (voice.phase + voice.freq * dt).fract();
                    voice.env *= decay;
                    // Alternate panning, Amiga style
                    if ch % 2 == 0 {
                        l += s * 0.75;
                        r += s * 0.35;
                    } else {
                        l += s * 0.35;
                        r += s * 0.75;
                    }
                }
            }
            left[frame] = l * master;
            right[frame] = r * master;
            written += 1;

            self.row_elapsed += dt;
            if self.row_elapsed >= row_seconds {
                self.row_elapsed -= row_seconds;
                if !self.advance_row() {
                    self.ended = true;
                    break;
                }
            }
        }
        written
    }

    fn set_position(&mut self, order: usize, row: usize) {
        self.order = order.min(self.order_table.len() - 1);
        let num_rows = self.current_pattern().num_rows;
        self.row = row.min(num_rows - 1);
        self.abs_row = self
            .order_table
            .iter()
            .take(self.order)
            .map(|&p| self.patterns[p].num_rows)
            .sum::<usize>()
            + self.row;
        self.row_elapsed = 0.0;
        self.needs_latch = true;
        self.ended = false;
        for voice in &mut self.voices {
            *voice = Voice::default();
        }
    }

    fn position(&self) -> DecoderPosition {
        DecoderPosition {
            order: self.order,
            row: self.row,
            seconds: self.abs_row as f64 * self.row_seconds() + self.row_elapsed,
        }
    }

    fn estimated_bpm(&self) -> f64 {
        self.bpm
    }

    fn order_pattern(&self, order: usize) -> usize {
        self.order_table.get(order).copied().unwrap_or(0)
    }

    fn pattern_num_rows(&self, pattern: usize) -> usize {
        self.patterns.get(pattern).map(|p| p.num_rows).unwrap_or(0)
    }

    fn cell(&self, pattern: usize, row: usize, channel: usize, field: CellField) -> i32 {
        self.patterns
            .get(pattern)
            .and_then(|p| p.cell(row, channel, self.channels))
            .map(|c| c[field as usize] as i32)
            .unwrap_or(0)
    }

    fn channel_vu(&self, channel: usize) -> f32 {
        self.voices
            .get(channel)
            .map(|v| v.env.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
        if repeat {
            self.ended = false;
        }
    }
}

/// Factory producing [`FixtureDecoder`] instances
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureDecoderFactory;

impl DecoderFactory for FixtureDecoderFactory {
    fn create(&self, bytes: &[u8]) -> Result<Box<dyn ModuleDecoder>, DecodeError> {
        Ok(Box::new(FixtureDecoder::parse(bytes)?))
    }
}

/// Builds fixture byte streams for tests and demos
pub struct FixtureBuilder {
    channels: usize,
    bpm: u8,
    title: String,
    order: Vec<u8>,
    patterns: Vec<(usize, Vec<[u8; 6]>)>,
}

impl FixtureBuilder {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            bpm: 125,
            title: String::new(),
            order: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn bpm(mut self, bpm: u8) -> Self {
        self.bpm = bpm;
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// Add an empty pattern; returns its index
    pub fn add_pattern(&mut self, num_rows: usize) -> usize {
        self.patterns
            .push((num_rows, vec![[0; 6]; num_rows * self.channels]));
        self.patterns.len() - 1
    }

    /// Append a play-sequence entry
    pub fn push_order(&mut self, pattern: usize) {
        self.order.push(pattern as u8);
    }

    /// Set a full cell
    pub fn set_cell(&mut self, pattern: usize, row: usize, channel: usize, cell: [u8; 6]) {
        let (_, cells) = &mut self.patterns[pattern];
        cells[row * self.channels + channel] = cell;
    }

    /// Place a note with default volume
    pub fn note(&mut self, pattern: usize, row: usize, channel: usize, note: u8, instrument: u8) {
        self.set_cell(pattern, row, channel, [note, instrument, 0, 0, 0, 0]);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.channels as u8);
        out.push(self.order.len() as u8);
        out.push(self.patterns.len() as u8);
        out.push(self.bpm);
        out.push(self.title.len() as u8);
        out.extend_from_slice(self.title.as_bytes());
        out.extend_from_slice(&self.order);
        for (num_rows, cells) in &self.patterns {
            out.push(*num_rows as u8);
            for cell in cells {
                out.extend_from_slice(cell);
            }
        }
        out
    }
}

/// A 4-channel, 64-row, single-order module with a few notes; the standard
/// test module used across the engine's test suites.
pub fn basic_module() -> Vec<u8> {
    let mut b = FixtureBuilder::new(4).bpm(125).title("fixture");
    let p = b.add_pattern(64);
    b.push_order(p);
    b.note(p, 0, 0, 60, 1);
    b.note(p, 16, 1, 64, 1);
    b.note(p, 32, 2, 67, 2);
    b.note(p, 48, 3, 72, 2);
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{CellField, DecodeError, ModuleDecoder};

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(
            FixtureDecoder::parse(b"not a module").unwrap_err(),
            DecodeError::InvalidFormat
        );
        assert_eq!(
            FixtureDecoder::parse(&[]).unwrap_err(),
            DecodeError::InvalidFormat
        );
    }

    #[test]
    fn test_rejects_truncated_pattern_data() {
        let mut bytes = basic_module();
        bytes.truncate(bytes.len() - 10);
        assert_eq!(
            FixtureDecoder::parse(&bytes).unwrap_err(),
            DecodeError::InvalidFormat
        );
    }

    #[test]
    fn test_metadata() {
        let decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        let meta = decoder.metadata();
        assert_eq!(meta.title, "fixture");
        assert_eq!(meta.num_orders, 1);
        assert_eq!(meta.num_channels, 4);
        assert_eq!(meta.initial_bpm, 125.0);
        // 64 rows at 125 BPM, 4 rows per beat
        let expected = 64.0 * 60.0 / (125.0 * 4.0);
        assert!((meta.duration_seconds - expected).abs() < 1e-9);
    }

    #[test]
    fn test_renders_until_end() {
        let mut decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        let mut left = vec![0.0f32; 4096];
        let mut right = vec![0.0f32; 4096];

        let mut total = 0usize;
        loop {
            let n = decoder.render_stereo(44100, &mut left, &mut right);
            if n == 0 {
                break;
            }
            total += n;
        }

        let expected = (decoder.metadata().duration_seconds * 44100.0) as usize;
        assert!(total.abs_diff(expected) < 4096, "rendered {} frames", total);
        // Terminal condition is sticky
        assert_eq!(decoder.render_stereo(44100, &mut left, &mut right), 0);
    }

    #[test]
    fn test_repeat_wraps_instead_of_ending() {
        let mut decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        decoder.set_repeat(true);
        let mut left = vec![0.0f32; 44100];
        let mut right = vec![0.0f32; 44100];
        for _ in 0..10 {
            assert!(decoder.render_stereo(44100, &mut left, &mut right) > 0);
        }
    }

    #[test]
    fn test_seek_clamps_and_resets_position() {
        let mut decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        decoder.set_position(0, 32);
        let pos = decoder.position();
        assert_eq!((pos.order, pos.row), (0, 32));
        assert!((pos.seconds - 32.0 * 60.0 / 500.0).abs() < 1e-9);

        decoder.set_position(99, 999);
        let pos = decoder.position();
        assert_eq!((pos.order, pos.row), (0, 63));
    }

    #[test]
    fn test_cell_queries() {
        let decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        assert_eq!(decoder.cell(0, 0, 0, CellField::Note), 60);
        assert_eq!(decoder.cell(0, 0, 0, CellField::Instrument), 1);
        assert_eq!(decoder.cell(0, 1, 0, CellField::Note), 0);
        // Out of range reads as 0
        assert_eq!(decoder.cell(5, 0, 0, CellField::Note), 0);
        assert_eq!(decoder.cell(0, 0, 9, CellField::Note), 0);
    }

    #[test]
    fn test_vu_follows_notes() {
        let mut decoder = FixtureDecoder::parse(&basic_module()).unwrap();
        let mut left = vec![0.0f32; 64];
        let mut right = vec![0.0f32; 64];
        decoder.render_stereo(44100, &mut left, &mut right);
        // Channel 0 has a note on row 0; channel 3's note is far away
        assert!(decoder.channel_vu(0) > 0.5);
        assert_eq!(decoder.channel_vu(3), 0.0);
    }
}
