//! Static configuration for driving a FUELFIRE model directory.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Top-level configuration, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FuelFireConfig {
    /// Sleep, staleness, and timeout intervals for the process controller.
    pub timing: ControllerTiming,
    /// Well-known file names inside a model directory.
    pub files: EngineFiles,
    /// How the engine executable and its helper signals are invoked.
    pub engine: EngineCommand,
    /// Replicate aggregation settings.
    pub replicates: ReplicateSettings,
    /// Optional RNG seed for the shuffled step order.
    pub rng_seed: Option<u64>,
}

impl FuelFireConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.timing.validate()?;
        self.replicates.validate()?;
        if !self.files.burn_pattern.contains("{n}") {
            return Err(CoreError::InvalidConfig("files.burn_pattern must contain {n}"));
        }
        Ok(())
    }
}

/// Controller time constants, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerTiming {
    /// Settle time after launching before the dismiss signal is sent.
    pub launch_wait_ms: u64,
    /// Sleep while the output artifact does not exist yet.
    pub access_sleep_ms: u64,
    /// An artifact untouched for longer than this is considered finished.
    pub mod_threshold_ms: u64,
    /// Sleep between staleness checks.
    pub mod_sleep_ms: u64,
    /// Sleep between forced-termination attempts.
    pub poll_sleep_ms: u64,
    /// Overall limit for waiting on the output artifact.
    pub wait_timeout_ms: u64,
    /// Limit for forced termination; exceeding it is fatal.
    pub kill_timeout_ms: u64,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            launch_wait_ms: 1_000,
            access_sleep_ms: 2_000,
            mod_threshold_ms: 2_000,
            mod_sleep_ms: 500,
            poll_sleep_ms: 500,
            wait_timeout_ms: 180_000,
            kill_timeout_ms: 20_000,
        }
    }
}

impl ControllerTiming {
    pub fn launch_wait(&self) -> Duration {
        Duration::from_millis(self.launch_wait_ms)
    }

    pub fn access_sleep(&self) -> Duration {
        Duration::from_millis(self.access_sleep_ms)
    }

    pub fn mod_threshold(&self) -> Duration {
        Duration::from_millis(self.mod_threshold_ms)
    }

    pub fn mod_sleep(&self) -> Duration {
        Duration::from_millis(self.mod_sleep_ms)
    }

    pub fn poll_sleep(&self) -> Duration {
        Duration::from_millis(self.poll_sleep_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.access_sleep_ms == 0 || self.mod_sleep_ms == 0 || self.poll_sleep_ms == 0 {
            return Err(CoreError::InvalidConfig("timing sleeps must be positive"));
        }
        if self.wait_timeout_ms == 0 || self.kill_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig("timing timeouts must be positive"));
        }
        Ok(())
    }
}

/// File names the engine reads and writes inside its working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineFiles {
    /// Numbered burn output pattern; `{n}` is replaced by the step number.
    pub burn_pattern: String,
    pub config: String,
    pub executable: String,
    pub age: String,
    pub fuel: String,
    /// Header lines preceding the cell values in a burn output grid.
    pub burn_header_rows: usize,
    pub record_store: String,
    pub repeat_store: String,
}

impl Default for EngineFiles {
    fn default() -> Self {
        Self {
            burn_pattern: "BURNT{n}OUT.TXT".to_string(),
            config: "FUELFIRE.CFG".to_string(),
            executable: "FUELFIRE.EXE".to_string(),
            age: "AGEPIX.DAT".to_string(),
            fuel: "CANOPIX.DAT".to_string(),
            burn_header_rows: 6,
            record_store: "record.duckdb".to_string(),
            repeat_store: "repeat.duckdb".to_string(),
        }
    }
}

impl EngineFiles {
    /// File name of burn output `n`.
    pub fn burn_output(&self, n: usize) -> String {
        self.burn_pattern.replace("{n}", &n.to_string())
    }
}

/// Engine invocation. Keystroke delivery and kill-by-name are host specific,
/// so each is an optional external helper command (program followed by args).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineCommand {
    /// Program to launch; defaults to `files.executable` inside the model directory.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Sent after launch to dismiss the startup dialog.
    pub dismiss: Option<Vec<String>>,
    /// Sent before forced termination (cancel and save signals).
    pub cancel: Option<Vec<String>>,
    /// Forced termination by process name, e.g. `TASKKILL /IM FUELFIRE.EXE /F`.
    pub kill: Option<Vec<String>>,
}

/// Replicate aggregation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplicateSettings {
    /// Footprint code used for the reached dilation.
    pub footprint: String,
    /// Recompute aggregates every this many replicates.
    pub calc_interval: usize,
    /// Cap on trials considered when computing aggregates.
    pub max_probability_reps: usize,
    /// Footprint code for the neighborhood median age.
    pub neighborhood_footprint: String,
}

impl Default for ReplicateSettings {
    fn default() -> Self {
        Self {
            footprint: "5ne".to_string(),
            calc_interval: 32,
            max_probability_reps: 256,
            neighborhood_footprint: "3sw".to_string(),
        }
    }
}

impl ReplicateSettings {
    fn validate(&self) -> Result<(), CoreError> {
        if self.calc_interval == 0 {
            return Err(CoreError::InvalidConfig("replicates.calc_interval must be positive"));
        }
        crate::FootprintMask::from_code(&self.footprint)?;
        crate::FootprintMask::from_code(&self.neighborhood_footprint)?;
        Ok(())
    }
}
