//! Process control and file collaborators for the external FUELFIRE engine.
//!
//! The engine has no IPC or exit-code contract: it reads two text grids and a
//! configuration file from its working directory, and writes numbered burn
//! output grids back. [`ProcessController`] infers completion from those
//! artifacts. Host-specific pieces (launching, keystroke delivery, forced
//! termination, wall-clock sleeping) sit behind [`EngineDriver`] and [`Clock`]
//! so a deterministic double can stand in for the real engine.

pub mod clock;
pub mod config_file;
pub mod controller;
pub mod driver;
pub mod gridfile;
pub mod paths;
pub mod provision;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::{io, path::PathBuf, time::Duration};

use fuelfire_core::CoreError;
use thiserror::Error;

pub use clock::{Clock, SystemClock};
pub use config_file::{ConfigFile, PresetBundle};
pub use controller::{ControllerState, ProcessController, ProcessHandle, RunReport, RunStatus};
pub use driver::{EngineDriver, ProcessDriver};
pub use paths::ModelPaths;
pub use provision::{CopyOptions, change_mosaic, copy_model};

/// Errors raised while driving the engine or editing its files.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed grid {path} line {line}: {message}")]
    Grid {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
    /// No output artifact settled before the wait timeout (only raised when
    /// the caller escalates).
    #[error("engine produced no finished output within {waited:?}")]
    WaitTimeout { waited: Duration },
    /// The engine resisted forced termination. Never retried.
    #[error("engine still running {elapsed:?} after forced termination began")]
    KillTimeout { elapsed: Duration },
    #[error("controller has no running engine")]
    NotStarted,
    #[error("configuration group {0} not found")]
    UnknownGroup(String),
    #[error("parameter {key} not found in group {group}")]
    UnknownParameter { group: String, key: String },
    #[error("unknown preset bundle `{0}`")]
    UnknownBundle(String),
    #[error("unknown preset `{preset}` for bundle {bundle}")]
    UnknownPreset { bundle: String, preset: String },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal conditions must not be retried by run loops.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::KillTimeout { .. })
    }
}
