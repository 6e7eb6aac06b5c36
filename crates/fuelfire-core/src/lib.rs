//! Core types shared across the FUELFIRE workspace.

pub mod config;
pub mod filter;
pub mod footprint;
pub mod grid;
pub mod trials;

use thiserror::Error;

pub use config::{ControllerTiming, EngineCommand, EngineFiles, FuelFireConfig, ReplicateSettings};
pub use filter::{max_filter, median_filter};
pub use footprint::{FootprintMask, Wedge};
pub use grid::{Grid, Mosaic};
pub use trials::{TrialCube, planes_for};

/// Errors raised by core grid, kernel, and configuration helpers.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    /// Two grids that must share a shape do not.
    #[error("grid shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    /// Raw cell storage does not match the requested dimensions.
    #[error("grid of {rows}x{cols} cannot hold {len} cells")]
    CellCount { rows: usize, cols: usize, len: usize },
    /// Footprint shorthand such as `5ne` could not be parsed.
    #[error("invalid footprint code `{0}`")]
    FootprintCode(String),
    /// A median filter needs at least one neighbor.
    #[error("footprint selects no cells")]
    EmptyFootprint,
    /// Trial index beyond the cube capacity.
    #[error("trial {index} exceeds capacity {capacity}")]
    TrialOutOfRange { index: usize, capacity: usize },
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
