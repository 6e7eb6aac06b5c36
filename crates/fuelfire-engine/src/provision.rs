//! Model directory provisioning.

use std::{fs, io, path::Path};

use fuelfire_core::{EngineFiles, Mosaic};
use tracing::info;

use crate::{EngineError, ModelPaths, gridfile};

/// Which persisted stores travel with a copied model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    pub record: bool,
    pub repeat: bool,
}

/// Recreate `dst` from `src`: engine binary, configuration, fuel and age
/// inputs, plus the record and replicate stores when requested and present.
/// Returns the number of files copied.
pub fn copy_model(
    src: &Path,
    dst: &Path,
    files: &EngineFiles,
    options: CopyOptions,
) -> Result<usize, EngineError> {
    match fs::remove_dir_all(dst) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(EngineError::io(dst, err)),
    }
    fs::create_dir_all(dst).map_err(|err| EngineError::io(dst, err))?;

    let mut names = vec![
        files.executable.as_str(),
        files.config.as_str(),
        files.fuel.as_str(),
        files.age.as_str(),
    ];
    if options.record && src.join(&files.record_store).exists() {
        names.push(files.record_store.as_str());
    }
    if options.repeat && src.join(&files.repeat_store).exists() {
        names.push(files.repeat_store.as_str());
    }

    for name in &names {
        let from = src.join(name);
        fs::copy(&from, dst.join(name)).map_err(|err| EngineError::io(&from, err))?;
    }
    info!(src = %src.display(), dst = %dst.display(), files = names.len(), "copied model");
    Ok(names.len())
}

/// Swap in a new mosaic from comma-delimited grids stored in the model
/// directory. The sources are transposed to the engine's orientation.
pub fn change_mosaic(paths: &ModelPaths, age_src: &Path, fuel_src: &Path) -> Result<Mosaic, EngineError> {
    let age = gridfile::read_delimited_grid(&paths.dir().join(age_src), ',')?.transpose();
    let fuel = gridfile::read_delimited_grid(&paths.dir().join(fuel_src), ',')?.transpose();
    let mosaic = Mosaic::new(age, fuel)?;
    gridfile::write_mosaic(paths, &mosaic)?;
    info!(shape = ?mosaic.shape(), "replaced mosaic");
    Ok(mosaic)
}
