//! Error types for session operations
//!
//! Only synchronous misuse and launch failures are reported here. Conditions
//! detected on the scheduler thread (end-of-stream, descriptor errors, the
//! child being reaped) reach the consumer through its delegate instead.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Session error type
#[derive(Error, Debug)]
pub enum SessionError {
    /// PTY allocation, fork or exec failed; the session stays unlaunched
    #[error("Failed to launch: {0}")]
    Launch(#[from] ptytask_pty::Error),

    /// `launch` was called on a session that already has a child
    #[error("Session was already launched")]
    AlreadyLaunched,

    /// The scheduler was given settings it cannot run with
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The session's scheduler has shut down
    #[error("Scheduler is no longer running")]
    SchedulerClosed,

    /// The operation needs a running child
    #[error("Session is not running")]
    NotRunning,

    /// A coprocess is already attached
    #[error("A coprocess is already attached")]
    AlreadyAttached,

    /// Logging was started while already active
    #[error("Session is already logging")]
    AlreadyLogging,

    /// The signal number does not name a signal
    #[error("Invalid signal number: {0}")]
    InvalidSignal(i32),

    /// The child's process group could not be signalled
    #[error("Failed to deliver signal: {0}")]
    Signal(#[source] ptytask_pty::Error),

    /// The coprocess could not be started
    #[error("Failed to start coprocess: {0}")]
    Coprocess(#[source] io::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
