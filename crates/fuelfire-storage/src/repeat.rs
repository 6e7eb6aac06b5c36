//! Replicate trials: repeated single-step runs from recorded landscapes.
//!
//! Slot `i` replicates recorded step `shuffled[i] + step_offset` (wrapping to
//! step 0 past the last step). Each replicate's burn grid is bitpacked into
//! the slot's trial planes. Every `calc_interval` replicates the slot's
//! per-cell counts are recomputed:
//!
//! - `hazard`: trials in which the cell burned.
//! - `reached`: trials in which the footprint dilation of the burn covers the cell.
//! - `burnifreach`: trials in which the cell was both burned and reached.

use std::path::{Path, PathBuf};

use duckdb::{Connection, params};
use fuelfire_core::{
    FootprintMask, Grid, ReplicateSettings, TrialCube, max_filter, median_filter, planes_for,
    trials::TRIALS_PER_PLANE,
};
use tracing::{Span, debug, info, info_span, warn};

use crate::{StepRecordStore, StorageError, codec, record::read_meta_table};

/// How a per-slot variable is laid out in its blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableEncoding {
    /// One signed byte per cell, offset by 127.
    Biased,
    /// Little-endian `u16` per cell.
    Counts,
}

impl VariableEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Biased => "biased",
            Self::Counts => "counts",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "biased" => Some(Self::Biased),
            "counts" => Some(Self::Counts),
            _ => None,
        }
    }
}

const BASE_VARIABLES: [(&str, VariableEncoding, &str); 5] = [
    ("age", VariableEncoding::Biased, "time since fire in model steps"),
    ("fuel", VariableEncoding::Biased, "fuel"),
    ("hazard", VariableEncoding::Counts, "burned"),
    ("reached", VariableEncoding::Counts, "reached"),
    ("burnifreach", VariableEncoding::Counts, "burned and reached"),
];

/// Neighborhood median age written by [`ReplicateStore::add_neighborhood_median`].
pub const NEIGHBORHOOD_MEDIAN: &str = "hoodmed";

/// Persisted state of one replicate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: usize,
    /// Recorded step the slot replicates, fixed on first use.
    pub step: usize,
    /// Trials appended so far.
    pub reps: usize,
}

/// Per-cell counts over the first `reps` trials of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAggregates {
    pub reps: usize,
    pub hazard: Grid<u16>,
    pub reached: Grid<u16>,
    pub burnifreach: Grid<u16>,
}

/// Bitpacked replicate trials and derived counts, layered over the step
/// record of the same model directory.
pub struct ReplicateStore {
    conn: Connection,
    path: PathBuf,
    records: StepRecordStore,
    rows: usize,
    cols: usize,
    planes: usize,
    step_offset: usize,
    settings: ReplicateSettings,
    footprint: FootprintMask,
    span: Span,
}

impl ReplicateStore {
    /// Create an empty store with room for `max_replicates` trials per slot
    /// (rounded up to whole byte planes), replacing any existing one.
    pub fn create(
        records: StepRecordStore,
        max_replicates: usize,
        step_offset: usize,
        settings: ReplicateSettings,
    ) -> Result<Self, StorageError> {
        let planes = planes_for(max_replicates);
        if planes == 0 {
            return Err(StorageError::NoReplicates);
        }
        let footprint = FootprintMask::from_code(&settings.footprint)?;
        let span = info_span!("replicates", model = %records.controller().paths().label());
        let path = records.controller().paths().repeat_store();
        let (rows, cols) = records.shape();

        let mut conn = Connection::open(&path)?;
        reset_schema(&conn)?;
        let tx = conn.transaction()?;
        {
            let mut meta = tx.prepare("insert or replace into repeat_meta (key, value) values (?, ?)")?;
            for (key, value) in [
                ("rows", rows),
                ("cols", cols),
                ("planes", planes),
                ("step_offset", step_offset),
            ] {
                meta.execute(params![key, value as i64])?;
            }
            let mut variables =
                tx.prepare("insert into variables (name, encoding, description) values (?, ?, ?)")?;
            for (name, encoding, description) in BASE_VARIABLES {
                variables.execute(params![name, encoding.as_str(), description])?;
            }
        }
        tx.commit()?;
        info!(parent: &span, planes, capacity = planes * TRIALS_PER_PLANE, step_offset, "created replicate store");

        Ok(Self {
            conn,
            path,
            records,
            rows,
            cols,
            planes,
            step_offset,
            settings,
            footprint,
            span,
        })
    }

    /// Open an existing store.
    pub fn open(records: StepRecordStore, settings: ReplicateSettings) -> Result<Self, StorageError> {
        let path = records.controller().paths().repeat_store();
        if !path.exists() {
            return Err(StorageError::MissingStore(path));
        }
        let footprint = FootprintMask::from_code(&settings.footprint)?;
        let span = info_span!("replicates", model = %records.controller().paths().label());
        let conn = Connection::open(&path)?;
        let rows = read_meta_table(&conn, "repeat_meta", "rows")?;
        let cols = read_meta_table(&conn, "repeat_meta", "cols")?;
        let planes = read_meta_table(&conn, "repeat_meta", "planes")?;
        let step_offset = read_meta_table(&conn, "repeat_meta", "step_offset")?;

        Ok(Self {
            conn,
            path,
            records,
            rows,
            cols,
            planes,
            step_offset,
            settings,
            footprint,
            span,
        })
    }

    /// Open the store if present, otherwise create one when a capacity was given.
    pub fn open_or_create(
        records: StepRecordStore,
        max_replicates: Option<usize>,
        step_offset: usize,
        settings: ReplicateSettings,
    ) -> Result<Self, StorageError> {
        let path = records.controller().paths().repeat_store();
        match max_replicates {
            _ if path.exists() => Self::open(records, settings),
            Some(reps) => Self::create(records, reps, step_offset, settings),
            None => Err(StorageError::MissingStore(path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &StepRecordStore {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut StepRecordStore {
        &mut self.records
    }

    pub fn into_records(self) -> StepRecordStore {
        self.records
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn plane_count(&self) -> usize {
        self.planes
    }

    /// Trials each slot can hold.
    pub fn capacity(&self) -> usize {
        self.planes * TRIALS_PER_PLANE
    }

    pub fn step_offset(&self) -> usize {
        self.step_offset
    }

    pub fn settings(&self) -> &ReplicateSettings {
        &self.settings
    }

    pub fn footprint(&self) -> &FootprintMask {
        &self.footprint
    }

    /// Use a different dilation kernel for subsequent aggregate updates.
    pub fn set_footprint(&mut self, footprint: FootprintMask) {
        self.footprint = footprint;
    }

    /// Recorded step slot `slot` replicates, from the shuffled order plus the
    /// offset, wrapping to step 0 beyond the last step.
    pub fn source_step(&self, slot: usize) -> Option<usize> {
        let step = self.records.shuffled_order().get(slot)? + self.step_offset;
        Some(if step > self.records.max_step() { 0 } else { step })
    }

    pub fn slot(&self, slot: usize) -> Result<Option<SlotInfo>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select step, reps from slots where slot = ?")?;
        let mut rows = stmt.query(params![slot as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(SlotInfo {
                slot,
                step: row.get::<_, i64>(0)? as usize,
                reps: row.get::<_, i64>(1)? as usize,
            })),
            None => Ok(None),
        }
    }

    /// Initialized slots in slot order.
    pub fn slots(&self) -> Result<Vec<SlotInfo>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select slot, step, reps from slots order by slot")?;
        let mut rows = stmt.query([])?;
        let mut slots = Vec::new();
        while let Some(row) = rows.next()? {
            slots.push(SlotInfo {
                slot: row.get::<_, i64>(0)? as usize,
                step: row.get::<_, i64>(1)? as usize,
                reps: row.get::<_, i64>(2)? as usize,
            });
        }
        Ok(slots)
    }

    pub fn slot_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("select count(*) from slots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn init_slot(&mut self, slot: usize, step: usize) -> Result<SlotInfo, StorageError> {
        let empty = TrialCube::new(self.capacity(), self.rows, self.cols);
        let tx = self.conn.transaction()?;
        tx.execute(
            "insert into slots (slot, step, reps, prob_reps) values (?, ?, 0, 0)",
            params![slot as i64, step as i64],
        )?;
        {
            let mut planes =
                tx.prepare("insert or replace into trials (slot, plane, data) values (?, ?, ?)")?;
            for (plane, data) in empty.planes().iter().cloned().enumerate() {
                planes.execute(params![slot as i64, plane as i64, data])?;
            }
        }
        tx.commit()?;
        debug!(parent: &self.span, slot, step, "initialized slot");
        Ok(SlotInfo {
            slot,
            step,
            reps: 0,
        })
    }

    /// Pack one burn grid into the next free trial of `slot`. Returns the
    /// slot's new replicate count.
    pub fn append_trial(&mut self, slot: usize, burn: &Grid<bool>) -> Result<usize, StorageError> {
        let info = self.slot(slot)?.ok_or(StorageError::MissingSlot(slot))?;
        let capacity = self.capacity();
        if info.reps >= capacity {
            return Err(StorageError::SlotFull { slot, capacity });
        }
        burn.ensure_shape(self.shape())?;

        let mut cube = self.trials(slot)?;
        cube.set_trial(info.reps, burn)?;
        let plane_index = info.reps / TRIALS_PER_PLANE;
        let plane = cube.plane(plane_index).map(<[u8]>::to_vec).unwrap_or_default();
        let reps = info.reps + 1;

        let tx = self.conn.transaction()?;
        tx.execute(
            "insert or replace into trials (slot, plane, data) values (?, ?, ?)",
            params![slot as i64, plane_index as i64, plane],
        )?;
        tx.execute(
            "update slots set reps = ? where slot = ?",
            params![reps as i64, slot as i64],
        )?;
        tx.commit()?;
        Ok(reps)
    }

    /// Every trial plane of `slot`.
    pub fn trials(&self, slot: usize) -> Result<TrialCube, StorageError> {
        let mut planes = vec![vec![0_u8; self.rows * self.cols]; self.planes];
        let mut stmt = self
            .conn
            .prepare("select plane, data from trials where slot = ? order by plane")?;
        let mut rows = stmt.query(params![slot as i64])?;
        while let Some(row) = rows.next()? {
            let index = row.get::<_, i64>(0)? as usize;
            if let Some(plane) = planes.get_mut(index) {
                *plane = row.get(1)?;
            }
        }
        Ok(TrialCube::from_planes(self.rows, self.cols, planes)?)
    }

    /// Append replicates until each slot holds `target` trials (default and
    /// maximum: capacity), for slots below `step_limit` (default: the record
    /// length). Slots whose source step is not recorded yet are skipped.
    /// Failed engine runs are retried without limit. Returns the number of
    /// trials appended.
    pub fn run_reps(
        &mut self,
        target: Option<usize>,
        step_limit: Option<usize>,
    ) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let capacity = self.capacity();
        let mut target = target.unwrap_or(capacity);
        if target > capacity {
            warn!(target, capacity, "target replicates exceed capacity, clamping");
            target = capacity;
        }
        let limit = step_limit
            .unwrap_or(self.records.step_count())
            .min(self.records.shuffled_order().len());
        let calc_interval = self.settings.calc_interval.max(1);
        let max_probability_reps = self.settings.max_probability_reps;
        info!(target, limit, "run replicates");

        let mut appended = 0;
        for slot in 0..limit {
            let Some(source) = self.source_step(slot) else {
                continue;
            };
            if !self.records.is_complete(source)? {
                debug!(slot, step = source, "source step not recorded, skipping");
                continue;
            }
            let info = match self.slot(slot)? {
                Some(info) => info,
                None => self.init_slot(slot, source)?,
            };

            let mut reps = info.reps;
            while reps < target {
                self.records.reload_mosaic(info.step)?;
                let Some(burn) = self.records.controller_mut().single_step()? else {
                    info!(slot, step = info.step, "retry replicate");
                    continue;
                };
                reps = self.append_trial(slot, &burn)?;
                appended += 1;
                let elapsed_ms = self
                    .records
                    .controller()
                    .last_report()
                    .map_or(0, |report| report.elapsed.as_millis() as u64);
                info!(slot, step = info.step, target, reps, elapsed_ms, "saved replicate");
                if reps % calc_interval == 0 {
                    self.step_probabilities(slot, info.step, max_probability_reps)?;
                }
            }
        }

        info!(appended, "run replicates completed");
        Ok(appended)
    }

    /// Copy the source step's mosaic into the slot and recompute its counts
    /// over at most `max_replicates` trials.
    pub fn step_probabilities(
        &mut self,
        slot: usize,
        source_step: usize,
        max_replicates: usize,
    ) -> Result<SlotAggregates, StorageError> {
        let info = self.slot(slot)?.ok_or(StorageError::MissingSlot(slot))?;
        let reps = info.reps.min(max_replicates);
        let mosaic = self.records.mosaic(source_step)?;
        let cube = self.trials(slot)?;

        let cells = self.rows * self.cols;
        let mut hazard = vec![0_u16; cells];
        let mut reached = vec![0_u16; cells];
        let mut burnifreach = vec![0_u16; cells];
        for trial in cube.trials(reps)? {
            let dilated = max_filter(&trial, &self.footprint);
            for (index, (&burned, &near)) in trial.cells().iter().zip(dilated.cells()).enumerate() {
                if burned {
                    hazard[index] = hazard[index].saturating_add(1);
                }
                if near {
                    reached[index] = reached[index].saturating_add(1);
                    if burned {
                        burnifreach[index] = burnifreach[index].saturating_add(1);
                    }
                }
            }
        }
        let aggregates = SlotAggregates {
            reps,
            hazard: Grid::from_cells(self.rows, self.cols, hazard)?,
            reached: Grid::from_cells(self.rows, self.cols, reached)?,
            burnifreach: Grid::from_cells(self.rows, self.cols, burnifreach)?,
        };

        let tx = self.conn.transaction()?;
        {
            let mut grids = tx.prepare(
                "insert or replace into slot_grids (slot, variable, data) values (?, ?, ?)",
            )?;
            let blobs = [
                ("age", codec::encode_biased(&mosaic.age)),
                ("fuel", codec::encode_biased(&mosaic.fuel)),
                ("hazard", codec::encode_counts(&aggregates.hazard)),
                ("reached", codec::encode_counts(&aggregates.reached)),
                ("burnifreach", codec::encode_counts(&aggregates.burnifreach)),
            ];
            for (name, data) in blobs {
                grids.execute(params![slot as i64, name, data])?;
            }
        }
        tx.execute(
            "update slots set prob_reps = ? where slot = ?",
            params![reps as i64, slot as i64],
        )?;
        tx.commit()?;
        debug!(parent: &self.span, slot, step = source_step, reps, "step probabilities");
        Ok(aggregates)
    }

    /// Recompute counts for every initialized slot below `step_limit`
    /// (default: all). Slots whose source step is not recorded are skipped.
    /// Returns the number of slots updated.
    pub fn update_step_probs(
        &mut self,
        step_limit: Option<usize>,
        max_replicates: usize,
    ) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let slots = self.slots()?;
        let limit = step_limit.unwrap_or(usize::MAX);
        let mut updated = 0;
        for info in slots.into_iter().filter(|info| info.slot < limit) {
            if !self.records.is_complete(info.step)? {
                debug!(slot = info.slot, step = info.step, "source step not recorded, skipping");
                continue;
            }
            self.step_probabilities(info.slot, info.step, max_replicates)?;
            updated += 1;
        }
        info!(updated, max_replicates, "updated step probabilities");
        Ok(updated)
    }

    /// Counts last written by [`Self::step_probabilities`], if any.
    pub fn aggregates(&self, slot: usize) -> Result<Option<SlotAggregates>, StorageError> {
        let reps: Option<i64> = {
            let mut stmt = self.conn.prepare("select prob_reps from slots where slot = ?")?;
            let mut rows = stmt.query(params![slot as i64])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(reps) = reps else {
            return Ok(None);
        };
        let (Some(hazard), Some(reached), Some(burnifreach)) = (
            self.count_grid(slot, "hazard")?,
            self.count_grid(slot, "reached")?,
            self.count_grid(slot, "burnifreach")?,
        ) else {
            return Ok(None);
        };
        Ok(Some(SlotAggregates {
            reps: reps as usize,
            hazard,
            reached,
            burnifreach,
        }))
    }

    fn grid_blob(&self, slot: usize, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select data from slot_grids where slot = ? and variable = ?")?;
        let mut rows = stmt.query(params![slot as i64, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn count_grid(&self, slot: usize, name: &str) -> Result<Option<Grid<u16>>, StorageError> {
        self.grid_blob(slot, name)?
            .map(|blob| codec::decode_counts(&blob, self.rows, self.cols))
            .transpose()
            .map_err(StorageError::from)
    }

    /// Declared variables with their encodings, by name.
    pub fn variables(&self) -> Result<Vec<(String, VariableEncoding)>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select name, encoding from variables order by name")?;
        let mut rows = stmt.query([])?;
        let mut variables = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let encoding =
                VariableEncoding::parse(&raw).ok_or_else(|| StorageError::UnknownVariable(raw))?;
            variables.push((name, encoding));
        }
        Ok(variables)
    }

    fn encoding_of(&self, name: &str) -> Result<Option<VariableEncoding>, StorageError> {
        Ok(self
            .variables()?
            .into_iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, encoding)| encoding))
    }

    fn declare_variable(
        &self,
        name: &str,
        encoding: VariableEncoding,
        description: &str,
    ) -> Result<(), StorageError> {
        if self.encoding_of(name)?.is_some() {
            return Ok(());
        }
        self.conn.execute(
            "insert into variables (name, encoding, description) values (?, ?, ?)",
            params![name, encoding.as_str(), description],
        )?;
        info!(parent: &self.span, variable = name, "added variable");
        Ok(())
    }

    /// Per-slot grid of a declared variable, widened to `i32`.
    pub fn variable_grid(&self, slot: usize, name: &str) -> Result<Option<Grid<i32>>, StorageError> {
        let encoding = self
            .encoding_of(name)?
            .ok_or_else(|| StorageError::UnknownVariable(name.to_string()))?;
        let Some(blob) = self.grid_blob(slot, name)? else {
            return Ok(None);
        };
        let grid = match encoding {
            VariableEncoding::Biased => codec::decode_biased(&blob, self.rows, self.cols)?,
            VariableEncoding::Counts => {
                codec::decode_counts(&blob, self.rows, self.cols)?.map(|&count| i32::from(count))
            }
        };
        Ok(Some(grid))
    }

    fn write_variable(&self, slot: usize, name: &str, grid: &Grid<i32>) -> Result<(), StorageError> {
        let encoding = self
            .encoding_of(name)?
            .ok_or_else(|| StorageError::UnknownVariable(name.to_string()))?;
        let data = match encoding {
            VariableEncoding::Biased => codec::encode_biased(grid),
            VariableEncoding::Counts => codec::encode_counts(
                &grid.map(|&value| value.clamp(0, i32::from(u16::MAX)) as u16),
            ),
        };
        self.conn.execute(
            "insert or replace into slot_grids (slot, variable, data) values (?, ?, ?)",
            params![slot as i64, name, data],
        )?;
        Ok(())
    }

    /// Fill `target` with the footprint median of `source` for every slot
    /// holding a `source` grid. `target` is declared with the source encoding
    /// on first use. Returns the number of slots written.
    pub fn derive_median_variable(
        &mut self,
        source: &str,
        target: &str,
        footprint: &FootprintMask,
        description: &str,
    ) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let encoding = self
            .encoding_of(source)?
            .ok_or_else(|| StorageError::UnknownVariable(source.to_string()))?;
        self.declare_variable(target, encoding, description)?;

        let mut written = 0;
        for info in self.slots()? {
            let Some(grid) = self.variable_grid(info.slot, source)? else {
                debug!(slot = info.slot, source, "no source grid, skipping");
                continue;
            };
            let filtered = median_filter(&grid, footprint)?;
            self.write_variable(info.slot, target, &filtered)?;
            written += 1;
        }
        info!(source, target, written, "derived median variable");
        Ok(written)
    }

    /// Write the neighborhood median age of each slot's source step into
    /// `hoodmed`. Uses the configured neighborhood footprint unless one is
    /// given. Returns the number of slots written.
    pub fn add_neighborhood_median(
        &mut self,
        footprint: Option<&FootprintMask>,
    ) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let configured;
        let footprint = match footprint {
            Some(mask) => mask,
            None => {
                configured = FootprintMask::from_code(&self.settings.neighborhood_footprint)?;
                &configured
            }
        };
        self.declare_variable(
            NEIGHBORHOOD_MEDIAN,
            VariableEncoding::Biased,
            "median age in neighborhood",
        )?;

        let mut written = 0;
        for info in self.slots()? {
            if !self.records.is_complete(info.step)? {
                debug!(slot = info.slot, step = info.step, "source step not recorded, skipping");
                continue;
            }
            let age = self.records.mosaic(info.step)?.age;
            let median = median_filter(&age, footprint)?;
            self.write_variable(info.slot, NEIGHBORHOOD_MEDIAN, &median)?;
            written += 1;
        }
        info!(written, "calculated neighborhood age");
        Ok(written)
    }

    /// Recompute every slot's source step from the shuffled order and the
    /// store's offset, and re-copy that step's age and fuel. Returns the
    /// number of slots resynchronized.
    pub fn resync_mosaics(&mut self) -> Result<usize, StorageError> {
        let span = self.span.clone();
        let _entered = span.enter();

        let mut fixed = 0;
        for info in self.slots()? {
            let Some(step) = self.source_step(info.slot) else {
                continue;
            };
            if !self.records.is_complete(step)? {
                debug!(slot = info.slot, step, "source step not recorded, skipping");
                continue;
            }
            let mosaic = self.records.mosaic(step)?;
            let tx = self.conn.transaction()?;
            tx.execute(
                "update slots set step = ? where slot = ?",
                params![step as i64, info.slot as i64],
            )?;
            for (name, grid) in [("age", &mosaic.age), ("fuel", &mosaic.fuel)] {
                tx.execute(
                    "insert or replace into slot_grids (slot, variable, data) values (?, ?, ?)",
                    params![info.slot as i64, name, codec::encode_biased(grid)],
                )?;
            }
            tx.commit()?;
            if step != info.step {
                info!(slot = info.slot, from = info.step, to = step, "moved slot source");
            }
            fixed += 1;
        }
        info!(fixed, "resynchronized slot mosaics");
        Ok(fixed)
    }
}

fn reset_schema(conn: &Connection) -> Result<(), duckdb::Error> {
    for table in ["repeat_meta", "slots", "trials", "variables", "slot_grids"] {
        conn.execute(&format!("drop table if exists {table}"), [])?;
    }
    conn.execute(
        "create table repeat_meta (
            key text primary key,
            value bigint not null
        )",
        [],
    )?;
    conn.execute(
        "create table slots (
            slot bigint primary key,
            step bigint not null,
            reps bigint not null,
            prob_reps bigint not null
        )",
        [],
    )?;
    conn.execute(
        "create table trials (
            slot bigint,
            plane bigint,
            data blob not null,
            primary key (slot, plane)
        )",
        [],
    )?;
    conn.execute(
        "create table variables (
            name text primary key,
            encoding text not null,
            description text
        )",
        [],
    )?;
    conn.execute(
        "create table slot_grids (
            slot bigint,
            variable text,
            data blob not null,
            primary key (slot, variable)
        )",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuelfire_core::{ControllerTiming, EngineFiles, Mosaic};
    use fuelfire_engine::{
        ModelPaths, ProcessController,
        testing::{ManualClock, ScriptedEngine, ScriptedRun, provision_model},
    };
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    const SIDE: usize = 5;

    fn burn_cells(cells: &[(usize, usize)]) -> Grid<bool> {
        let mut burn = Grid::filled(SIDE, SIDE, false);
        for &(row, col) in cells {
            *burn.get_mut(row, col).unwrap() = true;
        }
        burn
    }

    fn recorded(steps: usize, record_to: Option<usize>) -> (TempDir, StepRecordStore) {
        let dir = tempdir().unwrap();
        let files = EngineFiles::default();
        let mosaic = Mosaic::new(Grid::filled(SIDE, SIDE, 20), Grid::filled(SIDE, SIDE, 3)).unwrap();
        provision_model(dir.path(), &files, &mosaic).unwrap();
        let engine = ScriptedEngine::new(|_, _| ScriptedRun::Burn(burn_cells(&[(2, 2)])));
        let controller = ProcessController::new(
            ModelPaths::new(dir.path(), files),
            ControllerTiming::default(),
            Box::new(engine),
            Arc::new(ManualClock::new()),
        );
        let mut records = StepRecordStore::create(controller, steps, Some(5)).unwrap();
        records.run_steps(record_to).unwrap();
        (dir, records)
    }

    fn settings() -> ReplicateSettings {
        ReplicateSettings {
            footprint: "1".to_string(),
            calc_interval: 4,
            ..ReplicateSettings::default()
        }
    }

    #[test]
    fn capacity_rounds_up_to_planes() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(3, None);
        let store = ReplicateStore::create(records, 10, 0, settings())?;
        assert_eq!(store.plane_count(), 2);
        assert_eq!(store.capacity(), 16);
        assert_eq!(store.slot_count()?, 0);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let (_dir, records) = recorded(2, None);
        assert!(matches!(
            ReplicateStore::create(records, 0, 0, settings()),
            Err(StorageError::NoReplicates)
        ));
    }

    #[test]
    fn appended_trials_unpack_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(3, None);
        let mut store = ReplicateStore::create(records, 9, 0, settings())?;
        assert!(matches!(
            store.append_trial(0, &burn_cells(&[])),
            Err(StorageError::MissingSlot(0))
        ));
        store.init_slot(0, 1)?;

        let outcomes: Vec<Grid<bool>> = (0..9).map(|k| burn_cells(&[(k % SIDE, k / 2)])).collect();
        for (k, outcome) in outcomes.iter().enumerate() {
            assert_eq!(store.append_trial(0, outcome)?, k + 1);
        }
        let cube = store.trials(0)?;
        assert_eq!(cube.trials(9)?, outcomes);
        assert_eq!(store.slot(0)?.map(|info| info.reps), Some(9));
        Ok(())
    }

    #[test]
    fn full_slot_rejects_more_trials() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(2, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.init_slot(0, 0)?;
        for _ in 0..8 {
            store.append_trial(0, &burn_cells(&[(0, 0)]))?;
        }
        assert!(matches!(
            store.append_trial(0, &burn_cells(&[(0, 0)])),
            Err(StorageError::SlotFull { slot: 0, capacity: 8 })
        ));
        Ok(())
    }

    #[test]
    fn step_probabilities_counts_hazard_reach_and_burn_if_reached()
    -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(2, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.init_slot(0, 1)?;
        store.append_trial(0, &burn_cells(&[(2, 2), (2, 3)]))?;
        store.append_trial(0, &burn_cells(&[(2, 2)]))?;

        let all = store.step_probabilities(0, 1, 256)?;
        assert_eq!(all.reps, 2);
        assert_eq!(all.hazard.get(2, 2), Some(&2));
        assert_eq!(all.hazard.get(2, 3), Some(&1));
        assert_eq!(all.reached.get(2, 2), Some(&1));
        assert_eq!(all.reached.get(2, 3), Some(&2));
        assert_eq!(all.reached.get(1, 2), Some(&2));
        assert_eq!(all.reached.get(1, 3), Some(&1));
        assert_eq!(all.reached.get(2, 4), Some(&1));
        assert_eq!(all.reached.get(1, 1), Some(&0));
        assert_eq!(all.burnifreach.get(2, 2), Some(&1));
        assert_eq!(all.burnifreach.get(2, 3), Some(&1));
        assert_eq!(all.burnifreach.cells().iter().map(|&c| u32::from(c)).sum::<u32>(), 2);
        assert_eq!(store.aggregates(0)?, Some(all));

        let first = store.step_probabilities(0, 1, 1)?;
        assert_eq!(first.reps, 1);
        assert_eq!(first.hazard.get(2, 2), Some(&1));
        assert_eq!(first.reached.cells().iter().filter(|&&c| c > 0).count(), 8);

        let age = store.variable_grid(0, "age")?.unwrap();
        assert_eq!(age, store.records().mosaic(1)?.age);
        Ok(())
    }

    #[test]
    fn bounds_hold_after_run_reps() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(3, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.run_reps(Some(8), None)?;

        for info in store.slots()? {
            let aggregates = store.aggregates(info.slot)?.unwrap();
            for ((&hazard, &reached), &both) in aggregates
                .hazard
                .cells()
                .iter()
                .zip(aggregates.reached.cells())
                .zip(aggregates.burnifreach.cells())
            {
                assert!(usize::from(hazard) <= aggregates.reps);
                assert!(usize::from(reached) <= aggregates.reps);
                assert!(both <= hazard.min(reached));
            }
        }
        Ok(())
    }

    #[test]
    fn run_reps_fills_slots_and_aggregates_on_interval() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(4, None);
        let mut store = ReplicateStore::create(records, 16, 0, settings())?;

        assert_eq!(store.run_reps(Some(4), Some(2))?, 8);
        assert_eq!(store.slot_count()?, 2);
        let order = store.records().shuffled_order().to_vec();
        for slot in 0..2 {
            let info = store.slot(slot)?.unwrap();
            assert_eq!(info.step, order[slot]);
            assert_eq!(info.reps, 4);
            let aggregates = store.aggregates(slot)?.unwrap();
            assert_eq!(aggregates.reps, 4);
            assert_eq!(aggregates.hazard.get(2, 2), Some(&4));
        }

        // Re-running to the same target appends nothing.
        assert_eq!(store.run_reps(Some(4), Some(2))?, 0);
        Ok(())
    }

    #[test]
    fn target_is_clamped_to_capacity() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(2, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        assert_eq!(store.run_reps(Some(100), Some(1))?, 8);
        assert_eq!(store.slot(0)?.map(|info| info.reps), Some(8));
        Ok(())
    }

    #[test]
    fn unrecorded_sources_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(4, Some(1));
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.run_reps(Some(1), None)?;

        let slots = store.slots()?;
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|info| info.step <= 1));
        Ok(())
    }

    #[test]
    fn offset_wraps_past_last_step() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(4, None);
        let store = ReplicateStore::create(records, 8, 1, settings())?;
        let order = store.records().shuffled_order().to_vec();
        for (slot, &step) in order.iter().enumerate() {
            let expected = if step == 3 { 0 } else { step + 1 };
            assert_eq!(store.source_step(slot), Some(expected));
        }
        assert_eq!(store.source_step(order.len()), None);
        Ok(())
    }

    #[test]
    fn neighborhood_median_is_declared_once() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(3, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.run_reps(Some(1), None)?;

        let disk = FootprintMask::from_code("1")?;
        assert_eq!(store.add_neighborhood_median(Some(&disk))?, 3);
        assert_eq!(store.add_neighborhood_median(None)?, 3);
        let declared: Vec<String> = store.variables()?.into_iter().map(|(name, _)| name).collect();
        assert_eq!(declared.iter().filter(|name| *name == NEIGHBORHOOD_MEDIAN).count(), 1);

        let info = store.slot(0)?.unwrap();
        let age = store.records().mosaic(info.step)?.age;
        let expected = median_filter(&age, &FootprintMask::from_code("3sw")?)?;
        assert_eq!(store.variable_grid(0, NEIGHBORHOOD_MEDIAN)?, Some(expected));
        Ok(())
    }

    #[test]
    fn derived_median_requires_known_source() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(2, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        let disk = FootprintMask::from_code("1")?;
        assert!(matches!(
            store.derive_median_variable("missing", "out", &disk, "nothing"),
            Err(StorageError::UnknownVariable(_))
        ));

        store.run_reps(Some(4), None)?;
        let written = store.derive_median_variable("hazard", "hazmed", &disk, "median hazard")?;
        assert_eq!(written, 2);
        let derived = store.variable_grid(0, "hazmed")?.unwrap();
        let hazard = store.variable_grid(0, "hazard")?.unwrap();
        assert_eq!(derived, median_filter(&hazard, &disk)?);
        Ok(())
    }

    #[test]
    fn resync_moves_slots_to_current_offset_source() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, records) = recorded(3, None);
        let mut store = ReplicateStore::create(records, 8, 0, settings())?;
        store.init_slot(0, 2)?;
        assert_eq!(store.resync_mosaics()?, 1);

        let expected = store.source_step(0).unwrap();
        assert_eq!(store.slot(0)?.map(|info| info.step), Some(expected));
        assert_eq!(
            store.variable_grid(0, "fuel")?,
            Some(store.records().mosaic(expected)?.fuel)
        );
        Ok(())
    }
}
