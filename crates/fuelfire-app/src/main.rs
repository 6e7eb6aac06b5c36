use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fuelfire_app::{
    DEFAULT_PRINT_INCREMENT, PresetChoice, PropagateOptions, edit_config, init_tracing,
    load_config, propagate,
};
use fuelfire_core::{FootprintMask, FuelFireConfig};
use fuelfire_engine::{CopyOptions, ModelPaths, ProcessController, change_mosaic};
use fuelfire_storage::{ReplicateStore, StepRecordStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fuelfire",
    version,
    about = "Drive the FUELFIRE engine to record steps and replicate risk trials"
)]
struct Cli {
    /// JSON configuration file; defaults apply to anything it leaves out.
    #[arg(long, global = true, env = "FUELFIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Append log output to this file instead of stderr.
    #[arg(long, global = true, env = "FUELFIRE_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ModelDir {
    /// Model directory holding the engine, its configuration and mosaic inputs.
    dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy, configure, spin up, record, and replicate a model in one go.
    Propagate {
        /// Target model directory.
        dst: PathBuf,
        /// Source model to copy from.
        #[arg(long)]
        src: Option<PathBuf>,
        /// Copy the step record along with the model.
        #[arg(long)]
        copy_record: bool,
        /// Copy the replicate store along with the model.
        #[arg(long)]
        copy_repeats: bool,
        /// Configuration preset as BUNDLE=PRESET; repeatable.
        #[arg(long = "preset")]
        presets: Vec<PresetChoice>,
        /// Caption written to the configuration; enables preset edits.
        #[arg(long)]
        caption: Option<String>,
        /// Free-running steps before recording.
        #[arg(long, default_value_t = 0)]
        spinup: usize,
        /// Create a step record of this many steps.
        #[arg(long)]
        record_length: Option<usize>,
        /// Record steps up to and including this one.
        #[arg(long)]
        run_record: Option<usize>,
        /// Create a replicate store with this many trials per slot.
        #[arg(long)]
        repeat_length: Option<usize>,
        /// Replicates per slot to run.
        #[arg(long, requires = "repeat_slots")]
        repeats: Option<usize>,
        /// Number of slots to replicate.
        #[arg(long, requires = "repeats")]
        repeat_slots: Option<usize>,
        /// Offset added to shuffled steps of a new replicate store.
        #[arg(long, default_value_t = 0)]
        step_offset: usize,
    },
    /// Run the engine freely until numbered outputs reach a step.
    StraightSteps {
        #[command(flatten)]
        model: ModelDir,
        #[arg(long)]
        max_step: usize,
        /// Seconds between output checks.
        #[arg(long, default_value_t = 60)]
        check_interval: u64,
        #[arg(long, default_value_t = DEFAULT_PRINT_INCREMENT)]
        print_increment: usize,
    },
    /// Run the engine unattended for a while, then stop it.
    TimedRun {
        #[command(flatten)]
        model: ModelDir,
        #[arg(long)]
        minutes: u64,
    },
    /// Record pending steps of the step record.
    RunSteps {
        #[command(flatten)]
        model: ModelDir,
        /// Last step to record (inclusive).
        #[arg(long)]
        stop: Option<usize>,
        /// Create the record with this many steps when it does not exist.
        #[arg(long)]
        create: Option<usize>,
    },
    /// Append replicate trials.
    RunReps {
        #[command(flatten)]
        model: ModelDir,
        /// Target replicates per slot (default: capacity).
        #[arg(long)]
        reps: Option<usize>,
        /// Number of slots (default: record length).
        #[arg(long)]
        step_limit: Option<usize>,
        /// Create the store with this capacity when it does not exist.
        #[arg(long)]
        create: Option<usize>,
        #[arg(long, default_value_t = 0)]
        step_offset: usize,
    },
    /// Recompute hazard, reached and burn-if-reached counts for every slot.
    UpdateProbs {
        #[command(flatten)]
        model: ModelDir,
        /// Footprint code for the reach dilation (default: configured).
        #[arg(long)]
        footprint: Option<String>,
        /// Trials considered per slot (default: configured).
        #[arg(long)]
        max_reps: Option<usize>,
        #[arg(long)]
        step_limit: Option<usize>,
    },
    /// Compute the neighborhood median age of every slot.
    AddNeighbors {
        #[command(flatten)]
        model: ModelDir,
        /// Footprint code (default: configured).
        #[arg(long)]
        footprint: Option<String>,
    },
    /// Median-filter one per-slot variable into another.
    DeriveMedian {
        #[command(flatten)]
        model: ModelDir,
        source: String,
        target: String,
        #[arg(long)]
        footprint: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Re-point slots at their shuffled source step and re-copy age and fuel.
    ResyncMosaics {
        #[command(flatten)]
        model: ModelDir,
    },
    /// Apply configuration presets and a caption.
    EditConfig {
        #[command(flatten)]
        model: ModelDir,
        #[arg(long = "preset")]
        presets: Vec<PresetChoice>,
        #[arg(long)]
        caption: String,
    },
    /// Replace the mosaic inputs with comma-delimited grids from the model directory.
    ChangeMosaic {
        #[command(flatten)]
        model: ModelDir,
        age: PathBuf,
        fuel: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;
    let config = load_config(cli.config.as_deref())?;
    run(cli.command, &config)
}

fn controller(config: &FuelFireConfig, model: &ModelDir) -> ProcessController {
    ProcessController::from_config(&model.dir, config)
}

fn replicates(config: &FuelFireConfig, model: &ModelDir) -> Result<ReplicateStore> {
    let records =
        StepRecordStore::open(controller(config, model)).context("failed to open step record")?;
    ReplicateStore::open(records, config.replicates.clone())
        .context("failed to open replicate store")
}

fn footprint_or(code: Option<&str>, fallback: &str) -> Result<FootprintMask> {
    let code = code.unwrap_or(fallback);
    FootprintMask::from_code(code).with_context(|| format!("bad footprint code `{code}`"))
}

fn run(command: Command, config: &FuelFireConfig) -> Result<()> {
    match command {
        Command::Propagate {
            dst,
            src,
            copy_record,
            copy_repeats,
            presets,
            caption,
            spinup,
            record_length,
            run_record,
            repeat_length,
            repeats,
            repeat_slots,
            step_offset,
        } => {
            let options = PropagateOptions {
                dst,
                src,
                copy: CopyOptions {
                    record: copy_record,
                    repeat: copy_repeats,
                },
                presets,
                caption,
                spinup,
                record_length,
                run_record,
                repeat_length,
                run_repeats: repeats.zip(repeat_slots),
                step_offset,
            };
            propagate(config, &options)?;
        }
        Command::StraightSteps {
            model,
            max_step,
            check_interval,
            print_increment,
        } => controller(config, &model).straight_steps(
            max_step,
            Duration::from_secs(check_interval),
            print_increment,
        )?,
        Command::TimedRun { model, minutes } => {
            controller(config, &model).timed_run(Duration::from_secs(minutes * 60))?
        }
        Command::RunSteps {
            model,
            stop,
            create,
        } => {
            let mut records = StepRecordStore::open_or_create(
                controller(config, &model),
                create,
                config.rng_seed,
            )?;
            let recorded = records.run_steps(stop)?;
            info!(recorded, "recorded steps");
        }
        Command::RunReps {
            model,
            reps,
            step_limit,
            create,
            step_offset,
        } => {
            let records = StepRecordStore::open(controller(config, &model))?;
            let mut store = ReplicateStore::open_or_create(
                records,
                create,
                step_offset,
                config.replicates.clone(),
            )?;
            store.run_reps(reps, step_limit)?;
        }
        Command::UpdateProbs {
            model,
            footprint,
            max_reps,
            step_limit,
        } => {
            let mut store = replicates(config, &model)?;
            let mask = footprint_or(footprint.as_deref(), &config.replicates.footprint)?;
            store.set_footprint(mask);
            store.update_step_probs(
                step_limit,
                max_reps.unwrap_or(config.replicates.max_probability_reps),
            )?;
        }
        Command::AddNeighbors { model, footprint } => {
            let mask = footprint_or(
                footprint.as_deref(),
                &config.replicates.neighborhood_footprint,
            )?;
            replicates(config, &model)?.add_neighborhood_median(Some(&mask))?;
        }
        Command::DeriveMedian {
            model,
            source,
            target,
            footprint,
            description,
        } => {
            let mask = footprint_or(Some(&footprint), "")?;
            replicates(config, &model)?
                .derive_median_variable(&source, &target, &mask, &description)?;
        }
        Command::ResyncMosaics { model } => {
            replicates(config, &model)?.resync_mosaics()?;
        }
        Command::EditConfig {
            model,
            presets,
            caption,
        } => edit_config(&controller(config, &model), &presets, &caption)?,
        Command::ChangeMosaic { model, age, fuel } => {
            let paths = ModelPaths::new(&model.dir, config.files.clone());
            change_mosaic(&paths, &age, &fuel)?;
        }
    }
    Ok(())
}
