use std::{path::Path, sync::Arc};

use fuelfire_core::{ControllerTiming, EngineFiles, Grid, Mosaic, ReplicateSettings};
use fuelfire_engine::{
    ModelPaths, ProcessController,
    testing::{ManualClock, ScriptedEngine, ScriptedRun, provision_model},
};
use fuelfire_storage::{ReplicateStore, StepRecordStore, StorageError};
use tempfile::tempdir;

fn controller(dir: &Path, engine: ScriptedEngine) -> ProcessController {
    ProcessController::new(
        ModelPaths::new(dir, EngineFiles::default()),
        ControllerTiming::default(),
        Box::new(engine),
        Arc::new(ManualClock::new()),
    )
}

/// Burns a diagonal band that moves with the launch count.
fn band(launch: usize, mosaic: &Mosaic) -> ScriptedRun {
    let (rows, cols) = mosaic.shape();
    let mut burn = Grid::filled(rows, cols, false);
    for row in 0..rows {
        let col = (row + launch) % cols;
        *burn.get_mut(row, col).unwrap() = true;
    }
    ScriptedRun::Burn(burn)
}

#[test]
fn replicate_run_resumes_after_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mosaic = Mosaic::new(Grid::filled(4, 6, 30), Grid::filled(4, 6, 2))?;
    provision_model(dir.path(), &EngineFiles::default(), &mosaic)?;
    let settings = ReplicateSettings {
        footprint: "2".to_string(),
        calc_interval: 3,
        ..ReplicateSettings::default()
    };

    let order = {
        let mut records = StepRecordStore::create(controller(dir.path(), ScriptedEngine::new(band)), 5, Some(42))?;
        assert_eq!(records.run_steps(None)?, 5);
        let mut store = ReplicateStore::create(records, 12, 0, settings.clone())?;
        store.run_reps(Some(5), Some(2))?;
        store.records().shuffled_order().to_vec()
    };

    let records = StepRecordStore::open(controller(dir.path(), ScriptedEngine::new(band)))?;
    assert!(records.pending_steps()?.is_empty());
    let mut store = ReplicateStore::open_or_create(records, None, 0, settings)?;
    assert_eq!(store.capacity(), 16);

    let slots = store.slots()?;
    assert_eq!(slots.len(), 2);
    for info in &slots {
        assert_eq!(info.step, order[info.slot]);
        assert_eq!(info.reps, 5);
        assert_eq!(store.aggregates(info.slot)?.map(|agg| agg.reps), Some(3));
    }

    assert_eq!(store.run_reps(Some(9), Some(3))?, 4 + 4 + 9);
    for info in store.slots()? {
        assert_eq!(info.reps, 9);
        let aggregates = store.aggregates(info.slot)?.expect("aggregates at 9 reps");
        assert_eq!(aggregates.reps, 9);
        let cube = store.trials(info.slot)?;
        let burned: usize = cube.trials(9)?.iter().map(Grid::count_true).sum();
        let hazard: usize = aggregates.hazard.cells().iter().map(|&c| usize::from(c)).sum();
        assert_eq!(burned, hazard);
    }
    Ok(())
}

#[test]
fn replicates_need_a_record() {
    let dir = tempdir().unwrap();
    let mosaic = Mosaic::new(Grid::filled(2, 2, 1), Grid::filled(2, 2, 1)).unwrap();
    provision_model(dir.path(), &EngineFiles::default(), &mosaic).unwrap();

    let missing = StepRecordStore::open(controller(dir.path(), ScriptedEngine::new(band)));
    assert!(matches!(missing, Err(StorageError::MissingStore(_))));

    let records =
        StepRecordStore::create(controller(dir.path(), ScriptedEngine::new(band)), 2, Some(1)).unwrap();
    let store = ReplicateStore::open_or_create(records, None, 0, ReplicateSettings::default());
    assert!(matches!(store, Err(StorageError::MissingStore(_))));
}

#[test]
fn kill_timeout_stops_record_run() {
    let dir = tempdir().unwrap();
    let mosaic = Mosaic::new(Grid::filled(3, 3, 5), Grid::filled(3, 3, 5)).unwrap();
    provision_model(dir.path(), &EngineFiles::default(), &mosaic).unwrap();

    let engine = ScriptedEngine::new(band).resist_kill();
    let mut records = StepRecordStore::create(controller(dir.path(), engine), 3, Some(1)).unwrap();
    let err = records.run_steps(None).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(records.pending_steps().unwrap(), vec![0, 1, 2]);
}
