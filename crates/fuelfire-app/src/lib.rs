//! Propagation pipeline shared by the `fuelfire` binary and its tests.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use fuelfire_core::FuelFireConfig;
use fuelfire_engine::{CopyOptions, ProcessController, copy_model};
use fuelfire_storage::{ReplicateStore, StepRecordStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Seconds between checks for numbered outputs during spin-up.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Steps between spin-up progress messages.
pub const DEFAULT_PRINT_INCREMENT: usize = 20;

/// One `(bundle, preset)` configuration change, e.g. `risk=ONLY_H`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetChoice {
    pub bundle: String,
    pub preset: String,
}

impl std::str::FromStr for PresetChoice {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('=') {
            Some((bundle, preset)) if !bundle.trim().is_empty() && !preset.trim().is_empty() => {
                Ok(Self {
                    bundle: bundle.trim().to_string(),
                    preset: preset.trim().to_string(),
                })
            }
            _ => Err(format!("expected BUNDLE=PRESET, got `{raw}`")),
        }
    }
}

/// Apply `presets` and `caption` through the controller's configuration editor.
pub fn edit_config(
    controller: &ProcessController,
    presets: &[PresetChoice],
    caption: &str,
) -> Result<()> {
    let pairs: Vec<(&str, &str)> = presets
        .iter()
        .map(|choice| (choice.bundle.as_str(), choice.preset.as_str()))
        .collect();
    controller.edit_config(&pairs, caption).with_context(|| {
        let dir = controller.paths().dir().display();
        format!("failed to edit configuration in {dir}")
    })
}

/// Stages of building a model from another one. Every stage is optional and
/// runs in field order.
#[derive(Debug, Clone, Default)]
pub struct PropagateOptions {
    /// Target model directory.
    pub dst: PathBuf,
    /// Source model directory to copy from.
    pub src: Option<PathBuf>,
    /// Stores copied along with the model files.
    pub copy: CopyOptions,
    /// Configuration presets applied when a caption is set.
    pub presets: Vec<PresetChoice>,
    pub caption: Option<String>,
    /// Free-running steps before recording starts.
    pub spinup: usize,
    /// Create (or reset) a step record of this many steps.
    pub record_length: Option<usize>,
    /// Record steps up to and including this one.
    pub run_record: Option<usize>,
    /// Create (or reset) a replicate store with this many trials per slot.
    pub repeat_length: Option<usize>,
    /// `(replicates, slots)` to run.
    pub run_repeats: Option<(usize, usize)>,
    /// Offset added to the shuffled steps of a new replicate store.
    pub step_offset: usize,
}

/// What a propagation run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagateSummary {
    pub copied_files: usize,
    pub recorded_steps: usize,
    pub replicates: usize,
}

/// Run every requested stage against `options.dst`. `make_controller`
/// builds a fresh controller for the target directory at each stage.
pub fn propagate_with<F>(
    config: &FuelFireConfig,
    options: &PropagateOptions,
    mut make_controller: F,
) -> Result<PropagateSummary>
where
    F: FnMut(&Path) -> ProcessController,
{
    let dst = options.dst.as_path();
    let mut summary = PropagateSummary::default();

    if let Some(src) = &options.src {
        summary.copied_files = copy_model(src, dst, &config.files, options.copy)
            .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    }

    if let Some(caption) = &options.caption {
        edit_config(&make_controller(dst), &options.presets, caption)?;
    }

    if options.spinup > 0 {
        make_controller(dst)
            .straight_steps(options.spinup, DEFAULT_CHECK_INTERVAL, DEFAULT_PRINT_INCREMENT)
            .context("spin-up failed")?;
    }

    if let Some(length) = options.record_length {
        StepRecordStore::create(make_controller(dst), length, config.rng_seed)
            .context("failed to create step record")?;
    }

    if let Some(stop) = options.run_record {
        let mut records =
            StepRecordStore::open(make_controller(dst)).context("failed to open step record")?;
        summary.recorded_steps = records.run_steps(Some(stop))?;
    }

    if let Some(length) = options.repeat_length {
        let records =
            StepRecordStore::open(make_controller(dst)).context("failed to open step record")?;
        ReplicateStore::create(records, length, options.step_offset, config.replicates.clone())
            .context("failed to create replicate store")?;
    }

    if let Some((reps, slots)) = options.run_repeats {
        if reps > 0 && slots > 0 {
            let records =
                StepRecordStore::open(make_controller(dst)).context("failed to open step record")?;
            let mut store = ReplicateStore::open(records, config.replicates.clone())
                .context("failed to open replicate store")?;
            summary.replicates = store.run_reps(Some(reps), Some(slots))?;
        }
    }

    info!(dst = %dst.display(), ?summary, "propagation finished");
    Ok(summary)
}

/// [`propagate_with`] against the real engine executable.
pub fn propagate(config: &FuelFireConfig, options: &PropagateOptions) -> Result<PropagateSummary> {
    propagate_with(config, options, |dir| ProcessController::from_config(dir, config))
}

/// Read a JSON configuration file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<FuelFireConfig> {
    let config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<FuelFireConfig>(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => FuelFireConfig::default(),
    };
    if let Err(err) = config.validate() {
        bail!("invalid configuration: {err}");
    }
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// level; with `log_file` set, output is appended there instead of stderr.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.try_init();
        }
    }
    Ok(())
}
