//! Row-major landscape grids.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Rectangular grid stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<T>,
}

impl<T: Clone> Grid<T> {
    /// Create a grid with every cell set to `fill`.
    #[must_use]
    pub fn filled(rows: usize, cols: usize, fill: T) -> Self {
        Self {
            rows,
            cols,
            cells: vec![fill; rows * cols],
        }
    }
}

impl<T> Grid<T> {
    /// Wrap existing row-major cells.
    pub fn from_cells(rows: usize, cols: usize, cells: Vec<T>) -> Result<Self, CoreError> {
        if cells.len() != rows * cols {
            return Err(CoreError::CellCount {
                rows,
                cols,
                len: cells.len(),
            });
        }
        Ok(Self { rows, cols, cells })
    }

    /// Build from nested rows; every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Result<Self, CoreError> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut cells = Vec::with_capacity(height * width);
        for row in rows {
            if row.len() != width {
                return Err(CoreError::ShapeMismatch {
                    expected: (height, width),
                    found: (height, row.len()),
                });
            }
            cells.extend(row);
        }
        Ok(Self {
            rows: height,
            cols: width,
            cells,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.rows && col < self.cols {
            self.cells.get(row * self.cols + col)
        } else {
            None
        }
    }

    #[inline]
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if row < self.rows && col < self.cols {
            self.cells.get_mut(row * self.cols + col)
        } else {
            None
        }
    }

    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [T] {
        &mut self.cells
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.cells.chunks(self.cols.max(1)).take(self.rows)
    }

    /// Apply `f` to every cell, keeping the shape.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: self.cells.iter().map(f).collect(),
        }
    }

    /// Swap rows and columns.
    #[must_use]
    pub fn transpose(&self) -> Self
    where
        T: Clone,
    {
        let mut cells = Vec::with_capacity(self.cells.len());
        for col in 0..self.cols {
            for row in 0..self.rows {
                cells.push(self.cells[row * self.cols + col].clone());
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            cells,
        }
    }

    /// Error unless `other` has the same shape.
    pub fn ensure_shape(&self, shape: (usize, usize)) -> Result<(), CoreError> {
        if self.shape() == shape {
            Ok(())
        } else {
            Err(CoreError::ShapeMismatch {
                expected: shape,
                found: self.shape(),
            })
        }
    }
}

impl<T: PartialEq> Grid<T> {
    /// Fraction of cells equal between `self` and `other`.
    pub fn fraction_equal(&self, other: &Self) -> Result<f64, CoreError> {
        other.ensure_shape(self.shape())?;
        if self.cells.is_empty() {
            return Ok(1.0);
        }
        let same = self
            .cells
            .iter()
            .zip(&other.cells)
            .filter(|(a, b)| a == b)
            .count();
        Ok(same as f64 / self.cells.len() as f64)
    }
}

impl Grid<bool> {
    /// Number of `true` cells.
    pub fn count_true(&self) -> usize {
        self.cells.iter().filter(|&&cell| cell).count()
    }
}

/// Landscape state consumed and produced by the engine: time since fire and
/// fuel level per cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mosaic {
    pub age: Grid<i32>,
    pub fuel: Grid<i32>,
}

impl Mosaic {
    pub fn new(age: Grid<i32>, fuel: Grid<i32>) -> Result<Self, CoreError> {
        fuel.ensure_shape(age.shape())?;
        Ok(Self { age, fuel })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.age.shape()
    }
}
