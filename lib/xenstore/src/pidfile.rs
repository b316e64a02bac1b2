//! Pidfile locking (C10, §5 "Shared resources"): an advisory exclusive
//! lock held for the process's lifetime, released implicitly when the
//! file descriptor closes at process exit.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidfileError {
    #[error("failed to open pidfile {path}: {source}")]
    Open { path: String, source: std::io::Error },
    #[error("pidfile {path} is held by another process")]
    AlreadyLocked { path: String },
    #[error("failed to write pid into {path}: {source}")]
    Write { path: String, source: std::io::Error },
}

/// An exclusively-locked pidfile. The lock is released when this value is
/// dropped, which only happens at process exit in normal operation.
pub struct Pidfile {
    _file: File,
    path: String,
}

impl Pidfile {
    pub fn acquire(path: &Path, pid: u32) -> Result<Self, PidfileError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| PidfileError::Open { path: path.display().to_string(), source })?;

        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| PidfileError::AlreadyLocked { path: path.display().to_string() })?;

        write!(file, "{pid}").map_err(|source| PidfileError::Write { path: path.display().to_string(), source })?;

        Ok(Self { _file: file, path: path.display().to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
