//! Morphological max and median filters driven by a [`FootprintMask`].
//!
//! Neighbors falling outside the grid are mirrored back in (`d c b a | a b c d | d c b a`).

use rayon::prelude::*;

use crate::{CoreError, FootprintMask, Grid};

#[inline]
fn reflect(index: isize, len: usize) -> usize {
    let n = len as isize;
    let period = 2 * n;
    let mut i = index.rem_euclid(period);
    if i >= n {
        i = period - i - 1;
    }
    i as usize
}

/// Dilation: a cell is set when any footprint offset lands on a set input cell.
pub fn max_filter(input: &Grid<bool>, footprint: &FootprintMask) -> Grid<bool> {
    let (rows, cols) = input.shape();
    if rows == 0 || cols == 0 {
        return input.clone();
    }
    let offsets = footprint.offsets();
    let source = input.cells();
    let mut out = vec![false; rows * cols];

    out.par_chunks_mut(cols).enumerate().for_each(|(row, line)| {
        for (col, cell) in line.iter_mut().enumerate() {
            *cell = offsets.iter().any(|&(dy, dx)| {
                let r = reflect(row as isize + dy, rows);
                let c = reflect(col as isize + dx, cols);
                source[r * cols + c]
            });
        }
    });

    Grid::from_cells(rows, cols, out).unwrap_or_else(|_| Grid::filled(rows, cols, false))
}

/// Median of the footprint neighborhood; with an even neighbor count the
/// upper of the two middle values is taken.
pub fn median_filter(input: &Grid<i32>, footprint: &FootprintMask) -> Result<Grid<i32>, CoreError> {
    let offsets = footprint.offsets();
    if offsets.is_empty() {
        return Err(CoreError::EmptyFootprint);
    }
    let (rows, cols) = input.shape();
    if rows == 0 || cols == 0 {
        return Ok(input.clone());
    }
    let source = input.cells();
    let mut out = vec![0_i32; rows * cols];

    out.par_chunks_mut(cols).enumerate().for_each(|(row, line)| {
        let mut window = Vec::with_capacity(offsets.len());
        for (col, cell) in line.iter_mut().enumerate() {
            window.clear();
            window.extend(offsets.iter().map(|&(dy, dx)| {
                let r = reflect(row as isize + dy, rows);
                let c = reflect(col as isize + dx, cols);
                source[r * cols + c]
            }));
            window.sort_unstable();
            *cell = window[window.len() / 2];
        }
    });

    Grid::from_cells(rows, cols, out)
}
