//! ptytask-pty - pseudoterminal allocation and child process control
//!
//! This crate is the OS-facing layer underneath `ptytask`:
//! - PTY master allocation (`posix_openpt` on Linux, `openpty` on macOS)
//! - Spawning a program as session leader with the slave as controlling terminal
//! - Exec failure reporting back to the parent
//! - Window size management (TIOCSWINSZ)
//! - Reaping and process-group signalling
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/posix_openpt.3.html

mod child;
mod error;
mod pty;
mod size;

pub use child::{signal_group, try_wait, wait, Child, ChildBuilder, ExitStatus};
pub use error::{Error, Result};
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use pty::Pty;
pub use size::WindowSize;
