//! Bitpacked storage for boolean trial outcomes.
//!
//! Trials are grouped eight to a byte plane. Plane `p` holds one byte per
//! cell; trial `k` lives in plane `k / 8` at bit `k % 8`, counted from the
//! most significant bit.

use crate::{CoreError, Grid};

/// Bits per plane byte.
pub const TRIALS_PER_PLANE: usize = 8;

/// Number of byte planes needed to hold `trials` outcomes.
#[inline]
pub const fn planes_for(trials: usize) -> usize {
    trials.div_ceil(TRIALS_PER_PLANE)
}

#[inline]
const fn bit_mask(offset: usize) -> u8 {
    0x80 >> offset
}

/// Fixed-capacity cube of packed boolean grids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialCube {
    rows: usize,
    cols: usize,
    planes: Vec<Vec<u8>>,
}

impl TrialCube {
    /// Empty cube able to hold `capacity` trials (rounded up to whole planes).
    #[must_use]
    pub fn new(capacity: usize, rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            planes: vec![vec![0; rows * cols]; planes_for(capacity)],
        }
    }

    /// Rebuild a cube from stored planes; every plane must hold `rows * cols` bytes.
    pub fn from_planes(rows: usize, cols: usize, planes: Vec<Vec<u8>>) -> Result<Self, CoreError> {
        for plane in &planes {
            if plane.len() != rows * cols {
                return Err(CoreError::CellCount {
                    rows,
                    cols,
                    len: plane.len(),
                });
            }
        }
        Ok(Self { rows, cols, planes })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Maximum number of trials.
    pub fn capacity(&self) -> usize {
        self.planes.len() * TRIALS_PER_PLANE
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.planes.get(index).map(Vec::as_slice)
    }

    pub fn planes(&self) -> &[Vec<u8>] {
        &self.planes
    }

    /// Write trial `index` into its plane, replacing whatever bits were there.
    pub fn set_trial(&mut self, index: usize, outcome: &Grid<bool>) -> Result<(), CoreError> {
        let capacity = self.capacity();
        outcome.ensure_shape(self.shape())?;
        let plane = self
            .planes
            .get_mut(index / TRIALS_PER_PLANE)
            .ok_or(CoreError::TrialOutOfRange { index, capacity })?;
        pack_into(plane, index % TRIALS_PER_PLANE, outcome);
        Ok(())
    }

    /// Unpack trial `index`.
    pub fn trial(&self, index: usize) -> Result<Grid<bool>, CoreError> {
        let plane = self
            .planes
            .get(index / TRIALS_PER_PLANE)
            .ok_or(CoreError::TrialOutOfRange {
                index,
                capacity: self.capacity(),
            })?;
        unpack_from(plane, index % TRIALS_PER_PLANE, self.rows, self.cols)
    }

    /// Unpack the first `count` trials in append order.
    pub fn trials(&self, count: usize) -> Result<Vec<Grid<bool>>, CoreError> {
        (0..count).map(|index| self.trial(index)).collect()
    }
}

/// Set or clear bit `offset` of every byte in `plane` from `outcome`.
fn pack_into(plane: &mut [u8], offset: usize, outcome: &Grid<bool>) {
    let mask = bit_mask(offset);
    for (byte, &burned) in plane.iter_mut().zip(outcome.cells()) {
        if burned {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// Extract bit `offset` of every byte in `plane`.
fn unpack_from(
    plane: &[u8],
    offset: usize,
    rows: usize,
    cols: usize,
) -> Result<Grid<bool>, CoreError> {
    let mask = bit_mask(offset);
    Grid::from_cells(rows, cols, plane.iter().map(|&byte| byte & mask != 0).collect())
}
