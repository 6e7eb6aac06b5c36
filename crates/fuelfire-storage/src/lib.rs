//! DuckDB-backed persistence for FUELFIRE step records and replicate trials.
//!
//! Two single-file stores live in each model directory. The step record
//! (`record.duckdb`) keeps the age and fuel mosaic after every simulated step
//! plus a fixed shuffled step order. The replicate store (`repeat.duckdb`)
//! keeps bitpacked burn outcomes of repeated single-step runs and per-cell
//! aggregate counts derived from them.

pub mod codec;
pub mod record;
pub mod repeat;

use std::path::PathBuf;

use fuelfire_core::CoreError;
use fuelfire_engine::EngineError;
use thiserror::Error;

pub use record::StepRecordStore;
pub use repeat::{ReplicateStore, SlotAggregates, SlotInfo, VariableEncoding};

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("store not found at {0}")]
    MissingStore(PathBuf),
    #[error("store metadata `{0}` is missing")]
    MissingMetadata(&'static str),
    #[error("a step record needs at least one step")]
    NoSteps,
    #[error("a replicate store needs room for at least one trial")]
    NoReplicates,
    #[error("step {step} outside record of {steps} steps")]
    StepOutOfRange { step: usize, steps: usize },
    #[error("step {0} has not been recorded")]
    IncompleteStep(usize),
    #[error("replicate slot {0} has not been initialized")]
    MissingSlot(usize),
    #[error("replicate slot {slot} is full ({capacity} trials)")]
    SlotFull { slot: usize, capacity: usize },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
}

impl StorageError {
    /// Fatal engine conditions must stop every run loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Engine(err) if err.is_fatal())
    }
}
