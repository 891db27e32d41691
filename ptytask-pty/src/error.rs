//! Error types for PTY operations

use std::io;
use thiserror::Error;

/// PTY error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Allocating the master/slave pair failed
    #[error("Failed to create PTY: {0}")]
    PtyCreation(String),

    /// Setup failed in the parent before the child could run
    #[error("Failed to spawn child: {0}")]
    SpawnFailed(String),

    /// The child reported that its terminal setup or exec failed
    #[error("Failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Failed to set or query the window size
    #[error("Failed to set window size: {0}")]
    WindowSize(String),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;
