//! Session log capture
//!
//! A plain append-only copy of every byte read from the pty. Failures never
//! reach the session: a write error turns logging off.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SessionError};

#[derive(Debug, Default)]
pub struct LogSink {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` for appending, creating it if needed
    pub fn start(&mut self, path: &Path) -> Result<()> {
        if self.file.is_some() {
            return Err(SessionError::AlreadyLogging);
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::debug!(path = %path.display(), "session logging started");
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            tracing::debug!(path = ?self.path, "session logging stopped");
        }
        self.path = None;
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `data` verbatim; a failed write stops logging
    pub fn write(&mut self, data: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(data) {
            tracing::warn!(path = ?self.path, error = %e, "session log write failed, logging stopped");
            self.stop();
        }
    }
}
