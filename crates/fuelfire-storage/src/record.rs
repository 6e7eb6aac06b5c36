//! Sequential step record: the landscape after each simulated step.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use duckdb::{Connection, params};
use fuelfire_core::Mosaic;
use fuelfire_engine::ProcessController;
use rand::{SeedableRng, rngs::SmallRng, seq::SliceRandom};
use tracing::{Span, debug, info, info_span, warn};

use crate::{StorageError, codec};

/// Share of unchanged age cells above which a new step is rejected as a
/// repeat of its predecessor.
pub const MAX_UNCHANGED_FRACTION: f64 = 0.5;

/// Per-step age/fuel records plus the shuffled step order replicate runs
/// inherit. Owns the controller of its model directory.
pub struct StepRecordStore {
    conn: Connection,
    path: PathBuf,
    controller: ProcessController,
    rows: usize,
    cols: usize,
    steps: usize,
    shuffled: Vec<usize>,
    span: Span,
}

impl StepRecordStore {
    /// Create an empty record of `step_count` steps, replacing any existing
    /// one. The spatial shape comes from the engine's current age input,
    /// which is also kept as the baseline step 0 starts from.
    pub fn create(
        controller: ProcessController,
        step_count: usize,
        seed: Option<u64>,
    ) -> Result<Self, StorageError> {
        if step_count == 0 {
            return Err(StorageError::NoSteps);
        }
        let span = info_span!("records", model = %controller.paths().label());
        let entered = span.enter();

        let path = controller.paths().record_store();
        let baseline = controller.read_mosaic()?;
        let (rows, cols) = baseline.shape();

        let mut shuffled: Vec<usize> = (0..step_count).collect();
        let mut rng = SmallRng::seed_from_u64(seed.unwrap_or_else(rand::random));
        shuffled.shuffle(&mut rng);

        let mut conn = Connection::open(&path)?;
        reset_schema(&conn)?;

        let tx = conn.transaction()?;
        {
            let mut meta = tx.prepare("insert or replace into record_meta (key, value) values (?, ?)")?;
            for (key, value) in [("rows", rows), ("cols", cols), ("steps", step_count)] {
                meta.execute(params![key, value as i64])?;
            }

            let unset = codec::unset_blob(rows * cols);
            let mut step_rows =
                tx.prepare("insert into steps (step, complete, age, fuel) values (?, false, ?, ?)")?;
            for step in 0..step_count {
                step_rows.execute(params![step as i64, unset, unset])?;
            }

            let mut order = tx.prepare("insert into shufsteps (slot, step) values (?, ?)")?;
            for (slot, step) in shuffled.iter().enumerate() {
                order.execute(params![slot as i64, *step as i64])?;
            }

            tx.execute(
                "insert into baseline (id, age, fuel) values (0, ?, ?)",
                params![
                    codec::encode_biased(&baseline.age),
                    codec::encode_biased(&baseline.fuel)
                ],
            )?;
        }
        tx.commit()?;
        info!(steps = step_count, rows, cols, "created step record");
        drop(entered);

        Ok(Self {
            conn,
            path,
            controller,
            rows,
            cols,
            steps: step_count,
            shuffled,
            span,
        })
    }

    /// Open an existing record.
    pub fn open(controller: ProcessController) -> Result<Self, StorageError> {
        let path = controller.paths().record_store();
        if !path.exists() {
            return Err(StorageError::MissingStore(path));
        }
        let span = info_span!("records", model = %controller.paths().label());
        let conn = Connection::open(&path)?;

        let rows = read_meta(&conn, "rows")?;
        let cols = read_meta(&conn, "cols")?;
        let steps = read_meta(&conn, "steps")?;

        let mut stmt = conn.prepare("select step from shufsteps order by slot")?;
        let mut result = stmt.query([])?;
        let mut shuffled = Vec::with_capacity(steps);
        while let Some(row) = result.next()? {
            shuffled.push(row.get::<_, i64>(0)? as usize);
        }
        drop(result);
        drop(stmt);

        Ok(Self {
            conn,
            path,
            controller,
            rows,
            cols,
            steps,
            shuffled,
            span,
        })
    }

    /// Open the record if present, otherwise create one when a step count
    /// was given.
    pub fn open_or_create(
        controller: ProcessController,
        step_count: Option<usize>,
        seed: Option<u64>,
    ) -> Result<Self, StorageError> {
        let path = controller.paths().record_store();
        match step_count {
            _ if path.exists() => Self::open(controller),
            Some(count) => Self::create(controller, count, seed),
            None => Err(StorageError::MissingStore(path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ProcessController {
        &mut self.controller
    }

    pub fn step_count(&self) -> usize {
        self.steps
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Permutation of `0..step_count` fixed at creation.
    pub fn shuffled_order(&self) -> &[usize] {
        &self.shuffled
    }

    /// Largest step index in the shuffled order.
    pub fn max_step(&self) -> usize {
        self.shuffled.iter().copied().max().unwrap_or(0)
    }

    fn check_step(&self, step: usize) -> Result<(), StorageError> {
        if step < self.steps {
            Ok(())
        } else {
            Err(StorageError::StepOutOfRange {
                step,
                steps: self.steps,
            })
        }
    }

    pub fn is_complete(&self, step: usize) -> Result<bool, StorageError> {
        self.check_step(step)?;
        let complete: bool = self.conn.query_row(
            "select complete from steps where step = ?",
            params![step as i64],
            |row| row.get(0),
        )?;
        Ok(complete)
    }

    /// Steps not yet recorded, ascending.
    pub fn pending_steps(&self) -> Result<Vec<usize>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select step from steps where not complete order by step")?;
        let mut rows = stmt.query([])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            pending.push(row.get::<_, i64>(0)? as usize);
        }
        Ok(pending)
    }

    /// Recorded mosaic of a completed step.
    pub fn mosaic(&self, step: usize) -> Result<Mosaic, StorageError> {
        self.check_step(step)?;
        let (complete, age, fuel): (bool, Vec<u8>, Vec<u8>) = self.conn.query_row(
            "select complete, age, fuel from steps where step = ?",
            params![step as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if !complete {
            return Err(StorageError::IncompleteStep(step));
        }
        self.decode_mosaic(&age, &fuel)
    }

    /// Mosaic the record was created from.
    pub fn baseline(&self) -> Result<Mosaic, StorageError> {
        let (age, fuel) = self.baseline_blobs()?;
        self.decode_mosaic(&age, &fuel)
    }

    fn baseline_blobs(&self) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
        Ok(self.conn.query_row(
            "select age, fuel from baseline where id = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    fn decode_mosaic(&self, age: &[u8], fuel: &[u8]) -> Result<Mosaic, StorageError> {
        Ok(Mosaic::new(
            codec::decode_biased(age, self.rows, self.cols)?,
            codec::decode_biased(fuel, self.rows, self.cols)?,
        )?)
    }

    /// Write a recorded step back to the engine's input files.
    pub fn reload_mosaic(&self, step: usize) -> Result<(), StorageError> {
        let mosaic = self.mosaic(step)?;
        self.controller.write_mosaic(&mosaic)?;
        debug!(parent: &self.span, step, "reloaded mosaic");
        Ok(())
    }

    /// Write the baseline back to the engine's input files.
    pub fn reload_baseline(&self) -> Result<(), StorageError> {
        let mosaic = self.baseline()?;
        self.controller.write_mosaic(&mosaic)?;
        debug!(parent: &self.span, "reloaded baseline");
        Ok(())
    }

    /// Record the engine's current mosaic as `step`. Returns `false`, leaving
    /// the step pending, when the age grid is mostly unchanged from the
    /// previous step (the baseline for step 0).
    pub fn save_mosaic(&mut self, step: usize) -> Result<bool, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();
        self.check_step(step)?;

        let mosaic = self.controller.read_mosaic()?;
        mosaic.age.ensure_shape(self.shape())?;
        let age = codec::encode_biased(&mosaic.age);
        let fuel = codec::encode_biased(&mosaic.fuel);

        let previous = if step == 0 {
            self.baseline_blobs()?.0
        } else {
            self.conn.query_row(
                "select age from steps where step = ?",
                params![(step - 1) as i64],
                |row| row.get::<_, Vec<u8>>(0),
            )?
        };
        // Compare values as stored, after saturation.
        let stored = codec::decode_biased(&age, self.rows, self.cols)?;
        let previous = codec::decode_biased(&previous, self.rows, self.cols)?;
        let unchanged = stored.fraction_equal(&previous)?;
        if unchanged > MAX_UNCHANGED_FRACTION {
            warn!(step, unchanged, "mosaic is same as previous step");
            return Ok(false);
        }

        self.conn.execute(
            "insert or replace into steps (step, complete, age, fuel) values (?, true, ?, ?)",
            params![step as i64, age, fuel],
        )?;
        debug!(step, "saved step");
        Ok(true)
    }

    /// Record pending steps in ascending order, up to and including
    /// `stop_at`. Each step restarts the engine from the previous recorded
    /// step; failed or repeated runs are retried without limit. Returns the
    /// number of steps recorded.
    pub fn run_steps(&mut self, stop_at: Option<usize>) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let mut pending: VecDeque<usize> = self
            .pending_steps()?
            .into_iter()
            .filter(|&step| stop_at.is_none_or(|stop| step <= stop))
            .collect();
        info!(pending = pending.len(), ?stop_at, "run steps");

        let mut recorded = 0;
        while let Some(&step) = pending.front() {
            if step == 0 {
                self.reload_baseline()?;
            } else {
                self.reload_mosaic(step - 1)?;
            }

            let saved = match self.controller.single_step()? {
                Some(_) => self.save_mosaic(step)?,
                None => false,
            };
            if saved {
                info!(step, "completed step");
                pending.pop_front();
                recorded += 1;
            } else {
                info!(step, "retry step");
            }
        }

        info!(recorded, "run steps completed");
        Ok(recorded)
    }
}

fn reset_schema(conn: &Connection) -> Result<(), duckdb::Error> {
    for table in ["record_meta", "steps", "shufsteps", "baseline"] {
        conn.execute(&format!("drop table if exists {table}"), [])?;
    }
    conn.execute(
        "create table record_meta (
            key text primary key,
            value bigint not null
        )",
        [],
    )?;
    conn.execute(
        "create table steps (
            step bigint primary key,
            complete boolean not null,
            age blob not null,
            fuel blob not null
        )",
        [],
    )?;
    conn.execute(
        "create table shufsteps (
            slot bigint primary key,
            step bigint not null
        )",
        [],
    )?;
    conn.execute(
        "create table baseline (
            id integer primary key,
            age blob not null,
            fuel blob not null
        )",
        [],
    )?;
    Ok(())
}

pub(crate) fn read_meta_table(
    conn: &Connection,
    table: &str,
    key: &'static str,
) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare(&format!("select value from {table} where key = ?"))?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(row.get::<_, i64>(0)? as usize),
        None => Err(StorageError::MissingMetadata(key)),
    }
}

fn read_meta(conn: &Connection, key: &'static str) -> Result<usize, StorageError> {
    read_meta_table(conn, "record_meta", key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuelfire_core::{ControllerTiming, EngineFiles, Grid};
    use fuelfire_engine::{
        ModelPaths,
        testing::{ManualClock, ScriptedEngine, ScriptedRun, provision_model},
    };
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn controller(engine: ScriptedEngine) -> (TempDir, ProcessController) {
        let dir = tempdir().unwrap();
        let files = EngineFiles::default();
        let mosaic = Mosaic::new(Grid::filled(3, 3, 10), Grid::filled(3, 3, 4)).unwrap();
        provision_model(dir.path(), &files, &mosaic).unwrap();
        let controller = ProcessController::new(
            ModelPaths::new(dir.path(), files),
            ControllerTiming::default(),
            Box::new(engine),
            Arc::new(ManualClock::new()),
        );
        (dir, controller)
    }

    fn burn_center(_launch: usize, mosaic: &Mosaic) -> ScriptedRun {
        let (rows, cols) = mosaic.shape();
        let mut burn = Grid::filled(rows, cols, false);
        *burn.get_mut(rows / 2, cols / 2).unwrap() = true;
        ScriptedRun::Burn(burn)
    }

    #[test]
    fn create_allocates_unset_steps_and_permutation() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        let store = StepRecordStore::create(controller, 6, Some(3))?;

        assert_eq!(store.shape(), (3, 3));
        assert_eq!(store.pending_steps()?, vec![0, 1, 2, 3, 4, 5]);
        let mut order = store.shuffled_order().to_vec();
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(store.max_step(), 5);
        assert!(matches!(store.mosaic(2), Err(StorageError::IncompleteStep(2))));
        assert!(matches!(
            store.is_complete(6),
            Err(StorageError::StepOutOfRange { step: 6, steps: 6 })
        ));
        assert_eq!(store.baseline()?.age, Grid::filled(3, 3, 10));
        Ok(())
    }

    #[test]
    fn zero_steps_is_rejected() {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        assert!(matches!(
            StepRecordStore::create(controller, 0, None),
            Err(StorageError::NoSteps)
        ));
    }

    #[test]
    fn open_without_store_fails() {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        assert!(matches!(
            StepRecordStore::open_or_create(controller, None, None),
            Err(StorageError::MissingStore(_))
        ));
    }

    #[test]
    fn run_steps_chains_each_step_from_the_previous() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        let mut store = StepRecordStore::create(controller, 4, Some(1))?;

        assert_eq!(store.run_steps(None)?, 4);
        assert!(store.pending_steps()?.is_empty());

        // Unburned cells age by one per step; the center burns every time.
        let step3 = store.mosaic(3)?;
        assert_eq!(step3.age.get(0, 0), Some(&14));
        assert_eq!(step3.age.get(1, 1), Some(&0));
        assert_eq!(step3.fuel.get(2, 2), Some(&8));
        Ok(())
    }

    #[test]
    fn stop_at_is_inclusive() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        let mut store = StepRecordStore::create(controller, 5, Some(1))?;
        assert_eq!(store.run_steps(Some(2))?, 3);
        assert_eq!(store.pending_steps()?, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn unchanged_mosaic_is_rejected_and_retried() -> Result<(), Box<dyn std::error::Error>> {
        let engine = ScriptedEngine::new(|launch, mosaic| {
            if launch == 1 {
                ScriptedRun::Unchanged
            } else {
                burn_center(launch, mosaic)
            }
        });
        let stats = engine.stats();
        let (_dir, controller) = controller(engine);
        let mut store = StepRecordStore::create(controller, 2, Some(1))?;

        assert_eq!(store.run_steps(None)?, 2);
        assert_eq!(stats.launches(), 3);
        Ok(())
    }

    #[test]
    fn save_mosaic_compares_step_zero_with_baseline() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, controller) = controller(ScriptedEngine::new(burn_center));
        let mut store = StepRecordStore::create(controller, 3, Some(1))?;

        assert!(!store.save_mosaic(0)?);
        assert!(!store.is_complete(0)?);
        Ok(())
    }

    #[test]
    fn exactly_half_unchanged_is_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let files = EngineFiles::default();
        let start = Grid::from_rows(vec![vec![0, 0], vec![5, 5]])?;
        provision_model(dir.path(), &files, &Mosaic::new(start, Grid::filled(2, 2, 1))?)?;
        let controller = ProcessController::new(
            ModelPaths::new(dir.path(), files),
            ControllerTiming::default(),
            Box::new(ScriptedEngine::new(burn_center)),
            Arc::new(ManualClock::new()),
        );
        let mut store = StepRecordStore::create(controller, 2, Some(1))?;

        let half = Grid::from_rows(vec![vec![0, 0], vec![6, 6]])?;
        store
            .controller()
            .write_mosaic(&Mosaic::new(half, Grid::filled(2, 2, 2))?)?;
        assert!(store.save_mosaic(0)?);

        let three_quarters = Grid::from_rows(vec![vec![0, 0], vec![6, 7]])?;
        store
            .controller()
            .write_mosaic(&Mosaic::new(three_quarters, Grid::filled(2, 2, 3))?)?;
        assert!(!store.save_mosaic(1)?);

        assert!(store.is_complete(0)?);
        assert!(!store.is_complete(1)?);
        Ok(())
    }

    #[test]
    fn reopen_keeps_progress_and_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let files = EngineFiles::default();
        let mosaic = Mosaic::new(Grid::filled(2, 2, 1), Grid::filled(2, 2, 1))?;
        provision_model(dir.path(), &files, &mosaic)?;
        let make = || {
            ProcessController::new(
                ModelPaths::new(dir.path(), files.clone()),
                ControllerTiming::default(),
                Box::new(ScriptedEngine::new(burn_center)),
                Arc::new(ManualClock::new()),
            )
        };

        let order = {
            let mut store = StepRecordStore::create(make(), 4, Some(9))?;
            store.run_steps(Some(1))?;
            store.shuffled_order().to_vec()
        };

        let mut reopened = StepRecordStore::open_or_create(make(), Some(10), None)?;
        assert_eq!(reopened.step_count(), 4);
        assert_eq!(reopened.shuffled_order(), order.as_slice());
        assert_eq!(reopened.pending_steps()?, vec![2, 3]);
        assert_eq!(reopened.run_steps(None)?, 2);
        Ok(())
    }
}
