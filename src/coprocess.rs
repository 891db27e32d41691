//! Coprocess channel
//!
//! A coprocess is a shell command whose stdin receives everything the
//! session's child prints and whose stdout is typed into the child. It runs in
//! its own process group so stopping it also stops anything it started.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Pty output buffered for a coprocess that is not reading
const MAX_PENDING_INPUT: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Coprocess {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    pending_input: VecDeque<u8>,
    muted: bool,
    reaped: bool,
}

impl Coprocess {
    /// Start `command` under `/bin/sh -c` with non-blocking pipes
    ///
    /// A muted coprocess still exchanges bytes with the child, but the
    /// session stops forwarding the child's output to its delegate.
    pub fn launch(command: &str, muted: bool) -> io::Result<Self> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("coprocess pipes were not created"));
            }
        };
        set_nonblocking(stdin.as_raw_fd())?;
        set_nonblocking(stdout.as_raw_fd())?;

        tracing::debug!(pid = child.id(), command, muted, "coprocess started");
        Ok(Self {
            command: command.to_string(),
            child,
            stdin: Some(stdin),
            stdout,
            pending_input: VecDeque::new(),
            muted,
            reaped: false,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Descriptor to poll for coprocess output
    pub fn output_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// Descriptor to poll for writability, only while input is pending
    pub fn input_fd(&self) -> Option<RawFd> {
        if self.pending_input.is_empty() {
            return None;
        }
        self.stdin.as_ref().map(|stdin| stdin.as_raw_fd())
    }

    /// Buffer pty output for the coprocess's stdin
    pub fn queue_input(&mut self, data: &[u8]) {
        if self.stdin.is_none() {
            return;
        }
        let room = MAX_PENDING_INPUT.saturating_sub(self.pending_input.len());
        if data.len() > room {
            tracing::trace!(
                dropped = data.len() - room,
                "coprocess input buffer full, dropping output"
            );
        }
        self.pending_input.extend(&data[..data.len().min(room)]);
    }

    /// Read coprocess output; `Ok(0)` means it closed its stdout
    pub fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stdout.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Write as much pending input as the pipe takes
    ///
    /// A coprocess that closed its stdin gets no further input; that is not
    /// an error.
    pub fn flush_input(&mut self) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            self.pending_input.clear();
            return Ok(());
        };
        while !self.pending_input.is_empty() {
            let (front, _) = self.pending_input.as_slices();
            match stdin.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending_input.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(pid = self.child.id(), "coprocess closed its input");
                    self.stdin = None;
                    self.pending_input.clear();
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close the coprocess's input and kill its process group
    ///
    /// Never waits: returns whether the coprocess has already been reaped.
    /// Otherwise call [`Self::try_reap`] later until it returns true.
    pub fn terminate(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        let _ = self.flush_input();
        self.stdin = None;
        self.pending_input.clear();
        self.kill_group();
        self.try_reap()
    }

    /// Collect the exit status if the coprocess has exited
    pub fn try_reap(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.child.id(), %status, "coprocess reaped");
                self.reaped = true;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = self.child.id(), error = %e, "failed to reap coprocess");
                self.reaped = true;
            }
        }
        self.reaped
    }

    fn kill_group(&self) {
        let pgid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::debug!(pid = self.child.id(), error = %e, "coprocess group already gone");
        }
    }
}

impl Drop for Coprocess {
    fn drop(&mut self) {
        if !self.reaped {
            self.stdin = None;
            self.kill_group();
            // SIGKILL cannot be caught, so this wait is short.
            if let Err(e) = self.child.wait() {
                tracing::warn!(pid = self.child.id(), error = %e, "failed to reap coprocess");
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
