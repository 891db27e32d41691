//! ptytask - pty-backed child process sessions
//!
//! Runs a program on a pseudoterminal and moves bytes between it and a
//! consumer. Output is handed to a [`PtyDelegate`] on a scheduler thread;
//! input, resizes, signals and shutdown are requested from any thread.
//!
//! - `session`: launch, read/write passes, resize, signals, two-phase teardown
//! - `coprocess`: an auxiliary command wired between the child's output and input
//! - `logging`: verbatim capture of the child's output to a file
//! - `job`: foreground job name and working directory lookup
//! - `scheduler`: the background thread that polls sessions
//!
//! Terminal emulation is not done here; bytes are passed through untouched.

pub mod config;
pub mod coprocess;
pub mod delegate;
pub mod error;
pub mod job;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod write_queue;

pub use config::{ConfigError, ConfigOverrides, SessionConfig};
pub use coprocess::Coprocess;
pub use delegate::{ChannelDelegate, PtyDelegate, SessionEvent};
pub use error::{Result, SessionError};
pub use job::{JobInfo, JobResolver, ProcFs, ProcessInspector};
pub use logging::LogSink;
pub use ptytask_pty::{ChildBuilder, ExitStatus, Pid, Signal, WindowSize};
pub use scheduler::Scheduler;
pub use session::{PtySession, ReadOutcome, SessionSnapshot};
pub use write_queue::{Lane, WriteQueue};
