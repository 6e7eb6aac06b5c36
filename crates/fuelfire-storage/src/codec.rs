//! Blob encodings for per-cell grids.
//!
//! Mosaic grids are stored as one signed byte per cell, offset by 127 so the
//! engine's 0..=254 range fits. Byte `-128` marks a cell never written.
//! Aggregate counts are stored as little-endian `u16` per cell.

use fuelfire_core::{CoreError, Grid};

/// Offset subtracted before a mosaic value is stored.
pub const BIAS: i32 = 127;

/// Stored byte of a cell that was never written.
pub const UNSET: i8 = i8::MIN;

/// Encode a mosaic grid, saturating values outside `0..=254`.
pub fn encode_biased(grid: &Grid<i32>) -> Vec<u8> {
    grid.cells()
        .iter()
        .map(|&value| (value - BIAS).clamp(-127, 127) as i8 as u8)
        .collect()
}

/// Decode a mosaic grid. Unset cells decode to `-1`.
pub fn decode_biased(bytes: &[u8], rows: usize, cols: usize) -> Result<Grid<i32>, CoreError> {
    let cells = bytes
        .iter()
        .map(|&byte| i32::from(byte as i8) + BIAS)
        .collect();
    Grid::from_cells(rows, cols, cells)
}

/// Blob for a grid whose every cell is unset.
pub fn unset_blob(cells: usize) -> Vec<u8> {
    vec![UNSET as u8; cells]
}

pub fn encode_counts(grid: &Grid<u16>) -> Vec<u8> {
    grid.cells()
        .iter()
        .flat_map(|count| count.to_le_bytes())
        .collect()
}

pub fn decode_counts(bytes: &[u8], rows: usize, cols: usize) -> Result<Grid<u16>, CoreError> {
    if bytes.len() % 2 != 0 {
        return Err(CoreError::CellCount {
            rows,
            cols,
            len: bytes.len(),
        });
    }
    let cells = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Grid::from_cells(rows, cols, cells)
}
