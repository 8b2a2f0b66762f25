//! Pattern cache - per-order cell matrices precomputed at load time
//!
//! Built once when a module loads by reading every (row, channel) cell out
//! of the decoder, so neither the UI nor the backends re-query the decoder
//! per display frame. Read-only after construction; the next load replaces
//! the whole cache.

use crate::decoder::{CellField, ModuleDecoder};

/// Classification of a cell by its most significant populated field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellKind {
    #[default]
    Empty,
    Note,
    Instrument,
    Effect,
}

/// One pattern cell: note/instrument/volume/effect data for a single
/// channel at a single row. All fields use the decoder's 0-means-absent
/// convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cell {
    pub kind: CellKind,
    pub note: i32,
    pub instrument: i32,
    pub volume_cmd: i32,
    pub volume_value: i32,
    pub effect_cmd: i32,
    pub effect_value: i32,
}

impl Cell {
    /// Build a cell from the six raw decoder fields
    pub fn from_fields(fields: [i32; 6]) -> Self {
        let [note, instrument, volume_cmd, volume_value, effect_cmd, effect_value] = fields;
        let kind = if note > 0 {
            CellKind::Note
        } else if instrument > 0 {
            CellKind::Instrument
        } else if effect_cmd > 0 || effect_value > 0 || volume_cmd > 0 || volume_value > 0 {
            CellKind::Effect
        } else {
            CellKind::Empty
        };
        Self {
            kind,
            note,
            instrument,
            volume_cmd,
            volume_value,
            effect_cmd,
            effect_value,
        }
    }
}

/// The cell grid played at one order index
#[derive(Debug, Clone)]
pub struct PatternMatrix {
    /// Dense play-sequence index (0..num_orders)
    pub order: usize,
    /// The pattern this order resolves to
    pub pattern_index: usize,
    pub num_rows: usize,
    pub num_channels: usize,
    /// rows[row][channel]
    pub rows: Vec<Vec<Cell>>,
}

/// All pattern matrices for a loaded module, indexed by order
#[derive(Debug, Clone, Default)]
pub struct PatternCache {
    matrices: Vec<PatternMatrix>,
    total_rows: usize,
}

impl PatternCache {
    /// Materialize the full per-order cache from a decoder.
    ///
    /// Iterates every (order, row, channel) triple once; for typical modules
    /// this is a few thousand cell reads done at load time.
    pub fn build(decoder: &dyn ModuleDecoder) -> Self {
        let meta = decoder.metadata();
        let num_channels = meta.num_channels;

        let mut matrices = Vec::with_capacity(meta.num_orders);
        let mut total_rows = 0;
        for order in 0..meta.num_orders {
            let pattern_index = decoder.order_pattern(order);
            let num_rows = decoder.pattern_num_rows(pattern_index);
            let mut rows = Vec::with_capacity(num_rows);
            for row in 0..num_rows {
                let mut cells = Vec::with_capacity(num_channels);
                for channel in 0..num_channels {
                    let mut fields = [0i32; 6];
                    for (i, field) in CellField::ALL.into_iter().enumerate() {
                        fields[i] = decoder.cell(pattern_index, row, channel, field);
                    }
                    cells.push(Cell::from_fields(fields));
                }
                rows.push(cells);
            }
            total_rows += num_rows;
            matrices.push(PatternMatrix {
                order,
                pattern_index,
                num_rows,
                num_channels,
                rows,
            });
        }

        log::debug!(
            "pattern cache built: {} orders, {} rows total",
            matrices.len(),
            total_rows
        );

        Self {
            matrices,
            total_rows,
        }
    }

    /// The matrix for an order index, if cached
    pub fn get(&self, order: usize) -> Option<&PatternMatrix> {
        self.matrices.get(order)
    }

    /// Number of orders in the cache
    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    /// Sum of row counts across all orders
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Resolve an absolute row index to (order, row).
    ///
    /// Negative rows clamp to (0, 0); rows at or past the end clamp to the
    /// last valid (order, row).
    pub fn resolve_row(&self, absolute: i64) -> (usize, usize) {
        if absolute <= 0 || self.matrices.is_empty() {
            return (0, 0);
        }
        let mut remaining = absolute as usize;
        for matrix in &self.matrices {
            if remaining < matrix.num_rows {
                return (matrix.order, remaining);
            }
            remaining -= matrix.num_rows;
        }
        let last = &self.matrices[self.matrices.len() - 1];
        (last.order, last.num_rows.saturating_sub(1))
    }

    /// Absolute row index of (order, row), clamped into range
    pub fn absolute_row(&self, order: usize, row: usize) -> usize {
        let mut absolute = 0;
        for matrix in &self.matrices {
            if matrix.order == order {
                return absolute + row.min(matrix.num_rows.saturating_sub(1));
            }
            absolute += matrix.num_rows;
        }
        self.total_rows.saturating_sub(1)
    }
}
