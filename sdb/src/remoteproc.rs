//! Control of the companion core through the remoteproc sysfs interface.
//!
//! ```text
//! /sys/class/remoteproc/remoteproc0/
//!   state      read: offline | running | crashed | suspended | ...
//!              write: start | stop
//!   firmware   read/write: file name under /lib/firmware
//! ```
//!
//! The coprocessor must be running the sampling firmware before the
//! receiver's pool is created, since the rpmsg-sdb device only appears once
//! the firmware has announced its endpoint.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::trace::info;

/// Sysfs directory of the first remote processor.
pub const DEFAULT_REMOTEPROC_DIR: &str = "/sys/class/remoteproc/remoteproc0";

/// State reported by the `state` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcState {
    Offline,
    Running,
    Crashed,
    Suspended,
    /// Any state this crate does not name (e.g. `attached`, `invalid`).
    Other(String),
}

impl ProcState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "offline" => Self::Offline,
            "running" => Self::Running,
            "crashed" => Self::Crashed,
            "suspended" => Self::Suspended,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Running => write!(f, "running"),
            Self::Crashed => write!(f, "crashed"),
            Self::Suspended => write!(f, "suspended"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Error accessing a remoteproc attribute.
#[derive(Debug, Error)]
pub enum RemoteProcError {
    #[error("remoteproc attribute `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Handle to one remote processor's sysfs directory.
#[derive(Debug, Clone)]
pub struct RemoteProc {
    dir: PathBuf,
}

impl Default for RemoteProc {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTEPROC_DIR)
    }
}

impl RemoteProc {
    /// Uses `dir` as the remoteproc sysfs directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The sysfs directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, attr: &str) -> Result<String, RemoteProcError> {
        let path = self.dir.join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_owned())
            .map_err(|source| RemoteProcError::Io { path, source })
    }

    fn write(&self, attr: &str, value: &str) -> Result<(), RemoteProcError> {
        let path = self.dir.join(attr);
        fs::write(&path, value).map_err(|source| RemoteProcError::Io { path, source })
    }

    /// Reads the processor state.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be read.
    pub fn state(&self) -> Result<ProcState, RemoteProcError> {
        self.read("state").map(|raw| ProcState::parse(&raw))
    }

    /// Whether the processor reports `running`.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be read.
    pub fn is_running(&self) -> Result<bool, RemoteProcError> {
        Ok(self.state()? == ProcState::Running)
    }

    /// Name of the firmware file the processor boots.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be read.
    pub fn firmware(&self) -> Result<String, RemoteProcError> {
        self.read("firmware")
    }

    /// Selects the firmware file for the next start.
    ///
    /// The kernel only accepts this while the processor is offline.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be written.
    pub fn set_firmware(&self, name: &str) -> Result<(), RemoteProcError> {
        self.write("firmware", name)?;
        info!(firmware = name, "remoteproc firmware selected");
        Ok(())
    }

    /// Boots the processor with the selected firmware.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be written.
    pub fn start(&self) -> Result<(), RemoteProcError> {
        self.write("state", "start")?;
        info!(dir = %self.dir.display(), "remoteproc started");
        Ok(())
    }

    /// Shuts the processor down.
    ///
    /// # Errors
    ///
    /// [`RemoteProcError::Io`] if the attribute cannot be written.
    pub fn stop(&self) -> Result<(), RemoteProcError> {
        self.write("state", "stop")?;
        info!(dir = %self.dir.display(), "remoteproc stopped");
        Ok(())
    }
}
