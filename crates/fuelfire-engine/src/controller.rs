//! Launch, completion polling, and forced termination of one engine run.

use std::{
    collections::VecDeque,
    fs, io,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};

use fuelfire_core::{ControllerTiming, FuelFireConfig, Grid, Mosaic};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::{
    Clock, ConfigFile, EngineDriver, EngineError, ModelPaths, ProcessDriver, SystemClock,
    gridfile,
};

/// Outcome flag of the current or most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Ok,
    Failed,
}

impl RunStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Lifecycle of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    TimedOut,
    Killed,
}

/// Ephemeral handle for the engine launched by [`ProcessController::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub started_at: SystemTime,
    pub status: RunStatus,
    pub elapsed: Option<Duration>,
}

/// Summary kept after a run cycle ends and its handle is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub elapsed: Duration,
}

/// Controls one engine working directory.
///
/// Single-threaded and blocking: every wait is a sleep-poll loop against the
/// injected [`Clock`]. A wait timeout is recoverable (the run is marked
/// failed and the caller retries); a kill timeout is fatal and surfaces as
/// [`EngineError::KillTimeout`].
pub struct ProcessController {
    paths: ModelPaths,
    timing: ControllerTiming,
    driver: Box<dyn EngineDriver>,
    clock: Arc<dyn Clock>,
    handle: Option<ProcessHandle>,
    state: ControllerState,
    last_report: Option<RunReport>,
    span: Span,
}

impl ProcessController {
    pub fn new(
        paths: ModelPaths,
        timing: ControllerTiming,
        driver: Box<dyn EngineDriver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let span = info_span!("engine", model = %paths.label());
        Self {
            paths,
            timing,
            driver,
            clock,
            handle: None,
            state: ControllerState::Idle,
            last_report: None,
            span,
        }
    }

    /// Controller for a real engine executable using the wall clock.
    pub fn from_config(dir: impl Into<std::path::PathBuf>, config: &FuelFireConfig) -> Self {
        let paths = ModelPaths::new(dir, config.files.clone());
        Self::new(
            paths,
            config.timing.clone(),
            Box::new(ProcessDriver::new(config.engine.clone())),
            Arc::new(SystemClock),
        )
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    pub fn timing(&self) -> &ControllerTiming {
        &self.timing
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report
    }

    /// Status of the live run, or of the last finished one.
    pub fn status(&self) -> RunStatus {
        match (&self.handle, &self.last_report) {
            (Some(handle), _) => handle.status,
            (None, Some(report)) => report.status,
            (None, None) => RunStatus::Ok,
        }
    }

    fn mark_failed(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.status = RunStatus::Failed;
        }
    }

    /// Drop the handle, keeping its status and elapsed time as the last report.
    fn finish_cycle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.last_report = Some(RunReport {
                status: handle.status,
                elapsed: handle
                    .elapsed
                    .unwrap_or_else(|| self.clock.since(handle.started_at)),
            });
        }
        self.state = ControllerState::Idle;
    }

    /// Launch the engine. The burn artifact is guaranteed absent on return.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _entered = span.enter();

        self.state = ControllerState::Starting;
        remove_if_exists(&self.paths.burn_output(0))?;
        self.handle = Some(ProcessHandle {
            started_at: self.clock.now(),
            status: RunStatus::Ok,
            elapsed: None,
        });

        if let Err(err) = self.driver.launch(&self.paths) {
            self.handle = None;
            self.state = ControllerState::Idle;
            return Err(err);
        }
        self.clock.sleep(self.timing.launch_wait());
        if let Err(err) = self.driver.dismiss() {
            return Err(self.abort_cycle(err));
        }
        self.state = ControllerState::Running;
        debug!("engine started");
        Ok(())
    }

    /// Poll until the burn artifact exists and has been idle longer than the
    /// staleness threshold. Returns `Ok(false)` on timeout unless
    /// `fatal_on_timeout` escalates it to [`EngineError::WaitTimeout`].
    pub fn wait(&mut self, fatal_on_timeout: bool) -> Result<bool, EngineError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let started_at = self
            .handle
            .as_ref()
            .map(|handle| handle.started_at)
            .ok_or(EngineError::NotStarted)?;
        let burn = self.paths.burn_output(0);

        while self.clock.since(started_at) < self.timing.wait_timeout() {
            match self.driver.output_modified(&burn)? {
                None => self.clock.sleep(self.timing.access_sleep()),
                Some(modified) => {
                    if self.clock.since(modified) > self.timing.mod_threshold() {
                        self.state = ControllerState::Completed;
                        return Ok(true);
                    }
                    self.clock.sleep(self.timing.mod_sleep());
                }
            }
        }

        let waited = self.clock.since(started_at);
        warn!(waited_ms = waited.as_millis() as u64, "wait timeout");
        self.mark_failed();
        self.state = ControllerState::TimedOut;
        if fatal_on_timeout {
            Err(EngineError::WaitTimeout { waited })
        } else {
            Ok(false)
        }
    }

    /// Cancel, then force termination until the process reports exited.
    /// Returns the run's total elapsed time.
    pub fn kill(&mut self) -> Result<Duration, EngineError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let kill_started = self.clock.now();
        self.driver.cancel()?;
        while !self.driver.has_exited()? {
            let elapsed = self.clock.since(kill_started);
            if elapsed > self.timing.kill_timeout() {
                self.mark_failed();
                error!(elapsed_ms = elapsed.as_millis() as u64, "kill timeout");
                return Err(EngineError::KillTimeout { elapsed });
            }
            self.driver.force_kill()?;
            self.clock.sleep(self.timing.poll_sleep());
        }

        let run_elapsed = match self.handle.as_mut() {
            Some(handle) => {
                let elapsed = self.clock.since(handle.started_at);
                handle.elapsed = Some(elapsed);
                elapsed
            }
            None => Duration::ZERO,
        };
        self.state = ControllerState::Killed;
        Ok(run_elapsed)
    }

    /// One full start, wait, kill, read cycle. `Ok(None)` when the run failed
    /// (for example a wait timeout); callers retry.
    pub fn single_step(&mut self) -> Result<Option<Grid<bool>>, EngineError> {
        self.start()?;
        if let Err(err) = self.wait(false) {
            return Err(self.abort_cycle(err));
        }
        if let Err(err) = self.kill() {
            self.finish_cycle();
            return Err(err);
        }
        let burned = if self.status().is_ok() {
            self.read_burn_output()
        } else {
            Ok(None)
        };
        self.finish_cycle();
        burned
    }

    /// Let the engine run freely until numbered outputs up to `max_step` show
    /// up, logging every `print_increment` steps. Any failure restarts the
    /// whole cycle, without a retry cap or backoff.
    pub fn straight_steps(
        &mut self,
        max_step: usize,
        check_interval: Duration,
        print_increment: usize,
    ) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _entered = span.enter();
        info!(max_step, "straight steps");

        loop {
            self.remove_burn_outputs()?;
            self.start()?;
            if let Err(err) = self.watch_marks(max_step, check_interval, print_increment) {
                return Err(self.abort_cycle(err));
            }

            if let Err(err) = self.kill() {
                self.finish_cycle();
                return Err(err);
            }
            let succeeded = self.status().is_ok();
            self.finish_cycle();
            self.remove_burn_outputs()?;

            if succeeded {
                info!("straight steps completed");
                return Ok(());
            }
            info!("retrying straight steps");
        }
    }

    /// Wait for the first artifact, then poll numbered outputs up to
    /// `max_step`. An early engine exit marks the run failed.
    fn watch_marks(
        &mut self,
        max_step: usize,
        check_interval: Duration,
        print_increment: usize,
    ) -> Result<(), EngineError> {
        self.wait(false)?;
        if !self.status().is_ok() {
            return Ok(());
        }
        let mut marks: VecDeque<usize> = (0..max_step).step_by(print_increment.max(1)).collect();
        while let Some(&mark) = marks.front() {
            if self
                .driver
                .output_modified(&self.paths.burn_output(mark))?
                .is_some()
            {
                info!(steps = mark, "completed steps");
                marks.pop_front();
                continue;
            }
            if self.driver.has_exited()? {
                warn!(mark, "engine exited before reaching step");
                self.mark_failed();
                break;
            }
            self.clock.sleep(check_interval);
        }
        Ok(())
    }

    /// Stop the engine after `err` interrupted a live cycle and return the
    /// error to propagate. A kill timeout takes precedence over `err`.
    fn abort_cycle(&mut self, err: EngineError) -> EngineError {
        warn!(%err, "aborting engine cycle");
        self.mark_failed();
        let killed = self.kill();
        self.finish_cycle();
        match killed {
            Ok(_) => err,
            Err(kill_err) if kill_err.is_fatal() => kill_err,
            Err(kill_err) => {
                warn!(%kill_err, "engine stop after error failed");
                err
            }
        }
    }

    /// Run the engine unattended for `hold`, then stop it and clear its outputs.
    pub fn timed_run(&mut self, hold: Duration) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _entered = span.enter();
        info!(hold_secs = hold.as_secs(), "timed run");

        self.start()?;
        self.clock.sleep(hold);
        let killed = self.kill();
        self.finish_cycle();
        killed?;
        self.remove_burn_outputs()?;
        Ok(())
    }

    /// Delete `BURNT0OUT`, `BURNT1OUT`, ... up to the first missing one.
    pub fn remove_burn_outputs(&self) -> Result<usize, EngineError> {
        let mut removed = 0;
        loop {
            let path = self.paths.burn_output(removed);
            if !remove_if_exists(&path)? {
                return Ok(removed);
            }
            removed += 1;
        }
    }

    /// Read the single-step burn artifact, `None` if it is missing.
    pub fn read_burn_output(&self) -> Result<Option<Grid<bool>>, EngineError> {
        let path = self.paths.burn_output(0);
        if !path.exists() {
            return Ok(None);
        }
        gridfile::read_burn_grid(&path, self.paths.files().burn_header_rows).map(Some)
    }

    pub fn read_mosaic(&self) -> Result<Mosaic, EngineError> {
        gridfile::read_mosaic(&self.paths)
    }

    pub fn write_mosaic(&self, mosaic: &Mosaic) -> Result<(), EngineError> {
        gridfile::write_mosaic(&self.paths, mosaic)
    }

    /// Apply preset bundles and a caption to the engine configuration file.
    pub fn edit_config(&self, presets: &[(&str, &str)], caption: &str) -> Result<(), EngineError> {
        let _entered = self.span.enter();
        let mut config = ConfigFile::load(&self.paths.config())?;
        config.preset_modify(presets, caption)?;
        info!(?presets, caption, "modified configuration");
        Ok(())
    }
}

/// Remove `path`, reporting whether it existed.
fn remove_if_exists(path: &Path) -> Result<bool, EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(EngineError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ScriptedEngine, ScriptedRun, provision_model};
    use fuelfire_core::EngineFiles;
    use std::{
        cell::Cell,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };
    use tempfile::{TempDir, tempdir};

    fn setup(engine: ScriptedEngine) -> (TempDir, ProcessController, Arc<ManualClock>) {
        let dir = tempdir().unwrap();
        let files = EngineFiles::default();
        let mosaic = Mosaic::new(Grid::filled(3, 4, 5), Grid::filled(3, 4, 2)).unwrap();
        provision_model(dir.path(), &files, &mosaic).unwrap();
        let clock = Arc::new(ManualClock::new());
        let controller = ProcessController::new(
            ModelPaths::new(dir.path(), files),
            ControllerTiming::default(),
            Box::new(engine),
            clock.clone(),
        );
        (dir, controller, clock)
    }

    fn corner_burn(_launch: usize, mosaic: &Mosaic) -> ScriptedRun {
        let (rows, cols) = mosaic.shape();
        let mut burn = Grid::filled(rows, cols, false);
        *burn.get_mut(0, 0).unwrap() = true;
        ScriptedRun::Burn(burn)
    }

    /// Driver whose artifact timestamps and failures are set by the test.
    /// Each poll of the artifact refreshes its mtime until `refreshes` runs out.
    struct StubDriver {
        clock: Arc<ManualClock>,
        running: Arc<AtomicBool>,
        stamp: Arc<Mutex<Option<SystemTime>>>,
        refreshes: Cell<usize>,
        fail_dismiss: bool,
        fail_output: bool,
    }

    impl StubDriver {
        fn new(clock: Arc<ManualClock>, refreshes: usize) -> Self {
            Self {
                clock,
                running: Arc::new(AtomicBool::new(false)),
                stamp: Arc::new(Mutex::new(None)),
                refreshes: Cell::new(refreshes),
                fail_dismiss: false,
                fail_output: false,
            }
        }
    }

    impl EngineDriver for StubDriver {
        fn launch(&mut self, _paths: &ModelPaths) -> Result<(), EngineError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn dismiss(&mut self) -> Result<(), EngineError> {
            if self.fail_dismiss {
                return Err(EngineError::io("dialog", io::Error::other("no window")));
            }
            Ok(())
        }

        fn cancel(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn force_kill(&mut self) -> Result<(), EngineError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn has_exited(&mut self) -> Result<bool, EngineError> {
            Ok(!self.running.load(Ordering::SeqCst))
        }

        fn output_modified(&self, path: &Path) -> Result<Option<SystemTime>, EngineError> {
            if self.fail_output {
                return Err(EngineError::io(path, io::Error::other("unreadable")));
            }
            let mut stamp = self.stamp.lock().unwrap();
            let remaining = self.refreshes.get();
            if remaining > 0 {
                self.refreshes.set(remaining - 1);
                *stamp = Some(self.clock.now());
            }
            Ok(*stamp)
        }
    }

    fn stub_controller(driver: StubDriver, clock: Arc<ManualClock>) -> (TempDir, ProcessController) {
        let dir = tempdir().unwrap();
        let controller = ProcessController::new(
            ModelPaths::new(dir.path(), EngineFiles::default()),
            ControllerTiming::default(),
            Box::new(driver),
            clock,
        );
        (dir, controller)
    }

    #[test]
    fn wait_returns_once_artifact_goes_stale() {
        let clock = Arc::new(ManualClock::new());
        let driver = StubDriver::new(clock.clone(), 5);
        let stamp = driver.stamp.clone();
        let (_dir, mut controller) = stub_controller(driver, clock.clone());

        controller.start().unwrap();
        assert!(controller.wait(false).unwrap());

        let last_write = stamp.lock().unwrap().expect("artifact written");
        let idle = clock.since(last_write);
        let timing = controller.timing().clone();
        assert!(idle > timing.mod_threshold());
        assert!(idle <= timing.mod_threshold() + timing.mod_sleep());
        assert_eq!(controller.state(), ControllerState::Completed);
        assert_eq!(controller.status(), RunStatus::Ok);
    }

    #[test]
    fn artifact_that_keeps_changing_times_out() {
        let clock = Arc::new(ManualClock::new());
        let driver = StubDriver::new(clock.clone(), usize::MAX);
        let (_dir, mut controller) = stub_controller(driver, clock.clone());
        let before = clock.now();

        controller.start().unwrap();
        assert!(!controller.wait(false).unwrap());
        assert!(clock.since(before) >= controller.timing().wait_timeout());
        assert_eq!(controller.state(), ControllerState::TimedOut);
        assert_eq!(controller.status(), RunStatus::Failed);
    }

    #[test]
    fn failed_dismiss_stops_the_engine() {
        let clock = Arc::new(ManualClock::new());
        let mut driver = StubDriver::new(clock.clone(), 1);
        driver.fail_dismiss = true;
        let running = driver.running.clone();
        let (_dir, mut controller) = stub_controller(driver, clock);

        let err = controller.single_step().unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
        assert!(!err.is_fatal());
        assert!(!running.load(Ordering::SeqCst));
        assert!(controller.handle().is_none());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.last_report().map(|r| r.status), Some(RunStatus::Failed));
    }

    #[test]
    fn unreadable_artifact_stops_the_engine() {
        let clock = Arc::new(ManualClock::new());
        let mut driver = StubDriver::new(clock.clone(), 1);
        driver.fail_output = true;
        let running = driver.running.clone();
        let (_dir, mut controller) = stub_controller(driver, clock);

        assert!(matches!(controller.single_step(), Err(EngineError::Io { .. })));
        assert!(!running.load(Ordering::SeqCst));
        assert!(controller.handle().is_none());
        assert_eq!(controller.state(), ControllerState::Idle);

        assert!(controller.straight_steps(5, Duration::from_secs(60), 1).is_err());
        assert!(!running.load(Ordering::SeqCst));
        assert!(controller.handle().is_none());
    }

    #[test]
    fn single_step_returns_burn_grid_and_returns_to_idle() {
        let engine = ScriptedEngine::new(corner_burn);
        let stats = engine.stats();
        let (_dir, mut controller, _clock) = setup(engine);

        let burned = controller.single_step().unwrap().expect("burn grid");
        assert_eq!(burned.shape(), (3, 4));
        assert_eq!(burned.count_true(), 1);
        assert!(burned.get(0, 0).copied().unwrap());

        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.handle().is_none());
        let report = controller.last_report().unwrap();
        assert_eq!(report.status, RunStatus::Ok);
        assert!(report.elapsed >= controller.timing().launch_wait());
        assert_eq!(stats.launches(), 1);
        assert_eq!(stats.dismissals(), 1);
        assert_eq!(stats.cancels(), 1);
    }

    #[test]
    fn start_removes_stale_artifact() {
        let (dir, mut controller, _clock) = setup(ScriptedEngine::new(|_, _| ScriptedRun::Stall));
        let stale = dir.path().join("BURNT0OUT.TXT");
        fs::write(&stale, "stale").unwrap();

        controller.start().unwrap();
        assert!(!stale.exists());
        assert_eq!(controller.state(), ControllerState::Running);
    }

    #[test]
    fn wait_timeout_is_recoverable() {
        let (_dir, mut controller, clock) = setup(ScriptedEngine::new(|_, _| ScriptedRun::Stall));
        let before = clock.now();

        assert_eq!(controller.single_step().unwrap(), None);
        assert_eq!(controller.status(), RunStatus::Failed);
        assert!(clock.since(before) >= controller.timing().wait_timeout());
    }

    #[test]
    fn wait_timeout_can_be_escalated() {
        let (_dir, mut controller, _clock) = setup(ScriptedEngine::new(|_, _| ScriptedRun::Stall));
        controller.start().unwrap();
        let err = controller.wait(true).unwrap_err();
        assert!(matches!(err, EngineError::WaitTimeout { .. }));
        assert!(!err.is_fatal());
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }

    #[test]
    fn wait_requires_a_started_engine() {
        let (_dir, mut controller, _clock) = setup(ScriptedEngine::new(corner_burn));
        assert!(matches!(controller.wait(false), Err(EngineError::NotStarted)));
    }

    #[test]
    fn kill_timeout_is_fatal() {
        let engine = ScriptedEngine::new(corner_burn).resist_kill();
        let stats = engine.stats();
        let (_dir, mut controller, _clock) = setup(engine);

        let err = controller.single_step().unwrap_err();
        assert!(err.is_fatal());
        match err {
            EngineError::KillTimeout { elapsed } => {
                assert!(elapsed > controller.timing().kill_timeout());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(controller.status(), RunStatus::Failed);
        assert!(stats.kills() > 1);
    }

    #[test]
    fn straight_steps_retries_until_marks_appear() {
        let engine = ScriptedEngine::new(|launch, _| {
            if launch == 0 {
                ScriptedRun::Stall
            } else {
                ScriptedRun::Sequence(12)
            }
        });
        let stats = engine.stats();
        let (dir, mut controller, _clock) = setup(engine);

        controller
            .straight_steps(10, Duration::from_secs(60), 5)
            .unwrap();
        assert_eq!(stats.launches(), 2);
        assert!(!dir.path().join("BURNT0OUT.TXT").exists());
        assert!(!dir.path().join("BURNT5OUT.TXT").exists());
        assert_eq!(controller.status(), RunStatus::Ok);
    }

    #[test]
    fn straight_steps_restarts_when_engine_exits_early() {
        let engine = ScriptedEngine::new(|launch, _| {
            if launch == 0 {
                ScriptedRun::Sequence(3)
            } else {
                ScriptedRun::Sequence(20)
            }
        })
        .exit_after_output();
        let stats = engine.stats();
        let (_dir, mut controller, _clock) = setup(engine);

        controller
            .straight_steps(20, Duration::from_secs(60), 10)
            .unwrap();
        assert_eq!(stats.launches(), 2);
    }

    #[test]
    fn timed_run_clears_outputs() {
        let (dir, mut controller, clock) =
            setup(ScriptedEngine::new(|_, _| ScriptedRun::Sequence(4)));
        let before = clock.now();
        controller.timed_run(Duration::from_secs(600)).unwrap();
        assert!(clock.since(before) >= Duration::from_secs(600));
        assert!(!dir.path().join("BURNT0OUT.TXT").exists());
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn remove_burn_outputs_stops_at_first_gap() {
        let (dir, controller, _clock) = setup(ScriptedEngine::new(corner_burn));
        for n in [0, 1, 2, 4] {
            fs::write(dir.path().join(format!("BURNT{n}OUT.TXT")), "").unwrap();
        }
        assert_eq!(controller.remove_burn_outputs().unwrap(), 3);
        assert!(dir.path().join("BURNT4OUT.TXT").exists());
    }

    #[test]
    fn engine_updates_mosaic_inputs() {
        let (_dir, mut controller, _clock) = setup(ScriptedEngine::new(corner_burn));
        controller.single_step().unwrap();
        let mosaic = controller.read_mosaic().unwrap();
        assert_eq!(mosaic.age.get(0, 0), Some(&0));
        assert_eq!(mosaic.age.get(1, 1), Some(&6));
    }
}
