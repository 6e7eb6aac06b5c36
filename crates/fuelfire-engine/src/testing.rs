//! Deterministic stand-ins for the engine host and the wall clock.

use std::{
    fs,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use fuelfire_core::{EngineFiles, Grid, Mosaic};

use crate::{Clock, EngineDriver, EngineError, ModelPaths, gridfile};

/// Virtual clock: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Starts at the current wall-clock time so file modification times stay comparable.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// What a scripted launch produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRun {
    /// Burn the marked cells: their age and fuel reset to 0, every other cell
    /// ages by one. Writes burn output 0.
    Burn(Grid<bool>),
    /// Write numbered outputs `0..n` with nothing burned; the mosaic is untouched.
    Sequence(usize),
    /// Write burn output 0 with nothing burned and leave the mosaic untouched.
    Unchanged,
    /// Produce nothing.
    Stall,
}

/// Counters shared with the test after the engine is boxed into a controller.
#[derive(Debug, Default)]
pub struct EngineStats {
    launches: AtomicUsize,
    dismissals: AtomicUsize,
    cancels: AtomicUsize,
    kills: AtomicUsize,
}

impl EngineStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn dismissals(&self) -> usize {
        self.dismissals.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

type Script = Box<dyn FnMut(usize, &Mosaic) -> ScriptedRun + Send>;

/// Engine double that rewrites the model directory synchronously on launch.
pub struct ScriptedEngine {
    script: Script,
    stats: Arc<EngineStats>,
    running: bool,
    resist_kill: bool,
    exit_after_output: bool,
}

impl ScriptedEngine {
    /// `script` receives the launch index and the mosaic the engine was started from.
    pub fn new<F>(script: F) -> Self
    where
        F: FnMut(usize, &Mosaic) -> ScriptedRun + Send + 'static,
    {
        Self {
            script: Box::new(script),
            stats: Arc::new(EngineStats::default()),
            running: false,
            resist_kill: false,
            exit_after_output: false,
        }
    }

    /// Ignore forced termination forever.
    #[must_use]
    pub fn resist_kill(mut self) -> Self {
        self.resist_kill = true;
        self
    }

    /// Report the process as exited as soon as its outputs are written.
    #[must_use]
    pub fn exit_after_output(mut self) -> Self {
        self.exit_after_output = true;
        self
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    fn write_burn(paths: &ModelPaths, n: usize, burn: &Grid<bool>) -> Result<(), EngineError> {
        let header_rows = paths.files().burn_header_rows;
        let mut text = String::new();
        for line in 0..header_rows {
            text.push_str(&format!("header{line} 0\n"));
        }
        for row in burn.iter_rows() {
            let values: Vec<&str> = row
                .iter()
                .map(|&burned| if burned { "0" } else { "1" })
                .collect();
            text.push_str(&values.join(" "));
            text.push('\n');
        }
        let path = paths.burn_output(n);
        fs::write(&path, text).map_err(|err| EngineError::io(path, err))
    }
}

impl EngineDriver for ScriptedEngine {
    fn launch(&mut self, paths: &ModelPaths) -> Result<(), EngineError> {
        let launch = self.stats.launches.fetch_add(1, Ordering::SeqCst);
        let mosaic = gridfile::read_mosaic(paths)?;
        let (rows, cols) = mosaic.shape();
        let quiet = Grid::filled(rows, cols, false);

        match (self.script)(launch, &mosaic) {
            ScriptedRun::Burn(burn) => {
                burn.ensure_shape(mosaic.shape())?;
                let mut next = mosaic.clone();
                for ((age, fuel), &burned) in next
                    .age
                    .cells_mut()
                    .iter_mut()
                    .zip(next.fuel.cells_mut().iter_mut())
                    .zip(burn.cells())
                {
                    if burned {
                        *age = 0;
                        *fuel = 0;
                    } else {
                        *age += 1;
                        *fuel += 1;
                    }
                }
                gridfile::write_mosaic(paths, &next)?;
                Self::write_burn(paths, 0, &burn)?;
            }
            ScriptedRun::Sequence(count) => {
                for n in 0..count {
                    Self::write_burn(paths, n, &quiet)?;
                }
            }
            ScriptedRun::Unchanged => Self::write_burn(paths, 0, &quiet)?,
            ScriptedRun::Stall => {}
        }

        self.running = !self.exit_after_output;
        Ok(())
    }

    fn dismiss(&mut self) -> Result<(), EngineError> {
        self.stats.dismissals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), EngineError> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn force_kill(&mut self) -> Result<(), EngineError> {
        self.stats.kills.fetch_add(1, Ordering::SeqCst);
        if !self.resist_kill {
            self.running = false;
        }
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool, EngineError> {
        Ok(!self.running)
    }
}

/// Write the files a model directory needs: mosaic inputs, a minimal
/// configuration, and a placeholder executable.
pub fn provision_model(dir: &Path, files: &EngineFiles, mosaic: &Mosaic) -> Result<(), EngineError> {
    let paths = ModelPaths::new(dir, files.clone());
    gridfile::write_mosaic(&paths, mosaic)?;
    let config = paths.config();
    fs::write(&config, SAMPLE_CONFIG).map_err(|err| EngineError::io(&config, err))?;
    let exe = paths.executable();
    fs::write(&exe, b"").map_err(|err| EngineError::io(&exe, err))
}

/// Configuration text covering every parameter the preset bundles touch.
pub const SAMPLE_CONFIG: &str = "\
 &GETBASIC
  CAPTION = old caption
  SEED = 11
 /
 &GETFUEL
  IMMATURE_FUEL_FACTOR = 1
  MATURE_FUEL_FACTOR = 0.4
 /
 &GETSTATES
  NO_FREQ = 0
  LO_FREQ = 540
  MOD_FREQ = 250
  HI_FREQ = 65
  VHI_FREQ = 5
  EX_FREQ = 1
 /
 &GETSUPPRESS
  BEGIN_AT_STEP = 0
  CANCEL_AT_STEP = 9000
 /
";
