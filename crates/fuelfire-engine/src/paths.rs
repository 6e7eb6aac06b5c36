use std::path::{Path, PathBuf};

use fuelfire_core::EngineFiles;

/// Well-known file locations inside one model directory.
///
/// The engine reads and writes fixed paths, so a directory is a
/// single-writer resource: never run two controllers against the same one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    dir: PathBuf,
    files: EngineFiles,
}

impl ModelPaths {
    pub fn new(dir: impl Into<PathBuf>, files: EngineFiles) -> Self {
        Self {
            dir: dir.into(),
            files,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &EngineFiles {
        &self.files
    }

    /// Directory name, used as a log field.
    pub fn label(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    /// Numbered burn output `n`; output 0 is the single-step artifact.
    pub fn burn_output(&self, n: usize) -> PathBuf {
        self.dir.join(self.files.burn_output(n))
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join(&self.files.config)
    }

    pub fn executable(&self) -> PathBuf {
        self.dir.join(&self.files.executable)
    }

    pub fn age(&self) -> PathBuf {
        self.dir.join(&self.files.age)
    }

    pub fn fuel(&self) -> PathBuf {
        self.dir.join(&self.files.fuel)
    }

    pub fn record_store(&self) -> PathBuf {
        self.dir.join(&self.files.record_store)
    }

    pub fn repeat_store(&self) -> PathBuf {
        self.dir.join(&self.files.repeat_store)
    }
}
