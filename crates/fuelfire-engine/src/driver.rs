//! Host-specific engine process handling.

use std::{
    fs, io,
    path::Path,
    process::{Child, Command, Stdio},
    time::SystemTime,
};

use fuelfire_core::EngineCommand;
use tracing::{debug, warn};

use crate::{EngineError, ModelPaths};

/// Capabilities the controller needs from the engine host.
pub trait EngineDriver: Send {
    /// Launch the engine detached in the model directory.
    fn launch(&mut self, paths: &ModelPaths) -> Result<(), EngineError>;

    /// Dismiss the blocking dialog shown at startup.
    fn dismiss(&mut self) -> Result<(), EngineError>;

    /// Ask a running engine to cancel and save before termination.
    fn cancel(&mut self) -> Result<(), EngineError>;

    /// Issue one forced OS-level termination attempt.
    fn force_kill(&mut self) -> Result<(), EngineError>;

    /// Whether the launched process has exited (true when nothing was launched).
    fn has_exited(&mut self) -> Result<bool, EngineError>;

    /// Last modification time of an output artifact, `None` while it is not readable.
    fn output_modified(&self, path: &Path) -> Result<Option<SystemTime>, EngineError> {
        match fs::metadata(path) {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|err| EngineError::io(path, err)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(EngineError::io(path, err)),
        }
    }
}

/// Drives a real engine executable with `std::process::Command`.
///
/// Dismiss, cancel, and kill-by-name are delegated to the optional helper
/// commands from [`EngineCommand`]; without a kill helper the child handle
/// itself is killed.
#[derive(Debug)]
pub struct ProcessDriver {
    command: EngineCommand,
    child: Option<Child>,
}

impl ProcessDriver {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            child: None,
        }
    }

    fn run_helper(helper: Option<&[String]>, purpose: &'static str) -> Result<(), EngineError> {
        let Some((program, args)) = helper.and_then(<[String]>::split_first) else {
            debug!(purpose, "no helper configured");
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !status.success() {
            debug!(purpose, ?status, "helper exited unsuccessfully");
        }
        Ok(())
    }
}

impl EngineDriver for ProcessDriver {
    fn launch(&mut self, paths: &ModelPaths) -> Result<(), EngineError> {
        let program = self
            .command
            .program
            .clone()
            .unwrap_or_else(|| paths.executable().display().to_string());
        let child = Command::new(&program)
            .args(&self.command.args)
            .current_dir(paths.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EngineError::Spawn { program, source })?;
        debug!(pid = child.id(), "engine spawned");
        self.child = Some(child);
        Ok(())
    }

    fn dismiss(&mut self) -> Result<(), EngineError> {
        Self::run_helper(self.command.dismiss.as_deref(), "dismiss")
    }

    fn cancel(&mut self) -> Result<(), EngineError> {
        Self::run_helper(self.command.cancel.as_deref(), "cancel")
    }

    fn force_kill(&mut self) -> Result<(), EngineError> {
        Self::run_helper(self.command.kill.as_deref(), "kill")?;
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill() {
                warn!(?err, "kill on child handle failed");
            }
        }
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool, EngineError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(true);
        };
        let exited = child
            .try_wait()
            .map_err(|source| EngineError::Spawn {
                program: "engine".to_string(),
                source,
            })?
            .is_some();
        if exited {
            self.child = None;
        }
        Ok(exited)
    }
}

impl Drop for ProcessDriver {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Ok(None) = child.try_wait() {
            warn!(pid = child.id(), "engine still running on drop, killing");
            if let Err(err) = child.kill() {
                warn!(?err, "kill on drop failed");
                return;
            }
            let _ = child.wait();
        }
    }
}
