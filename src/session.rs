//! Pty session
//!
//! A [`PtySession`] owns one child process running on a pty. Consumers call
//! the control methods (`write`, `set_size`, `send_signal`, `stop`, logging
//! and coprocess control) from any thread; the [`Scheduler`] thread drives
//! reads, writes and teardown, and reports back through the [`PtyDelegate`].
//!
//! Lifecycle: unlaunched, running, exited, deregistered. A broken pipe can be
//! observed while running or exited and never clears. Teardown happens once:
//! the loop drains what the child already printed, closes the master, stops
//! the coprocess and the log, reaps the child (escalating to SIGKILL after the
//! grace period), and finally fires `on_deregistered`.
//!
//! [`Scheduler`]: crate::Scheduler

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use ptytask_pty::{signal_group, try_wait, ChildBuilder, ExitStatus, Pid, Pty, Signal, WindowSize};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::coprocess::Coprocess;
use crate::delegate::PtyDelegate;
use crate::error::{Result, SessionError};
use crate::job::JobResolver;
use crate::logging::LogSink;
use crate::scheduler::{Scheduler, Shared};
use crate::write_queue::{Lane, WriteQueue};

/// Most output forwarded while draining a session that is being torn down
const DRAIN_LIMIT: usize = 4 * 1024 * 1024;

/// How long a drain waits for output still in flight from an exited child
const DRAIN_WAIT_MS: u16 = 50;

/// Result of one [`PtySession::process_read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were forwarded
    Data(usize),
    /// Nothing to read right now
    Idle,
    /// The descriptor is closed or reached end-of-stream
    Closed,
}

/// Descriptors the scheduler should watch for one session
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PollTargets {
    pub master: Option<RawFd>,
    pub want_write: bool,
    pub coprocess_out: Option<RawFd>,
    pub coprocess_in: Option<RawFd>,
}

#[derive(Debug, Default)]
struct IoState {
    pty: Option<Pty>,
    pid: Option<Pid>,
    tty: Option<String>,
    path: Option<String>,
    command: Option<String>,
    size: Option<WindowSize>,
    pending_size: Option<WindowSize>,
    utf8: bool,
    status: Option<ExitStatus>,
    reaped: bool,
    killed: bool,
    reap_deadline: Option<Instant>,
}

/// Serializable view of a session for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub pid: Option<i32>,
    pub fd: Option<RawFd>,
    pub tty: Option<String>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub utf8: bool,
    pub exit_code: Option<i32>,
    pub exit: Option<String>,
    pub broken_pipe: bool,
    pub has_output: bool,
    pub log_path: Option<String>,
    pub coprocess: Option<String>,
    pub coprocess_muted: bool,
    pub deregistered: bool,
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PtySession")?;
        match self.pid {
            Some(pid) => write!(f, " pid={pid}")?,
            None => write!(f, " unlaunched")?,
        }
        if let Some(tty) = &self.tty {
            write!(f, " tty={tty}")?;
        }
        if let Some(fd) = self.fd {
            write!(f, " fd={fd}")?;
        }
        if let Some(exit) = &self.exit {
            write!(f, " ({exit})")?;
        }
        if self.broken_pipe {
            write!(f, " broken-pipe")?;
        }
        if let Some(command) = &self.coprocess {
            write!(f, " coprocess={command:?}")?;
        }
        Ok(())
    }
}

/// One pty-backed child process and everything attached to it
pub struct PtySession {
    this: Weak<PtySession>,
    scheduler: Weak<Shared>,
    config: SessionConfig,

    // Lock order: coprocess, writes, io. The retired, log, job and delegate
    // locks are leaves and are never held while taking another.
    coprocess: Mutex<Option<Coprocess>>,
    /// Detached coprocesses that were killed but not yet reaped
    retired: Mutex<Vec<Coprocess>>,
    writes: Mutex<WriteQueue>,
    io: Mutex<IoState>,
    log: Mutex<LogSink>,
    jobs: Mutex<JobResolver>,
    delegate: Mutex<Option<Arc<dyn PtyDelegate>>>,

    broken_pipe: AtomicBool,
    has_output: AtomicBool,
    stop_requested: AtomicBool,
    teardown_started: AtomicBool,
    deregistered: AtomicBool,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PtySession {
    /// Create an unlaunched session driven by `scheduler`
    pub fn new(scheduler: &Scheduler) -> Arc<Self> {
        let config = scheduler.config().clone();
        let writes = WriteQueue::new(config.write_quantum, config.write_buffer_limit);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            scheduler: scheduler.downgrade(),
            config,
            coprocess: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            writes: Mutex::new(writes),
            io: Mutex::new(IoState::default()),
            log: Mutex::new(LogSink::new()),
            jobs: Mutex::new(JobResolver::default()),
            delegate: Mutex::new(None),
            broken_pipe: AtomicBool::new(false),
            has_output: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            teardown_started: AtomicBool::new(false),
            deregistered: AtomicBool::new(false),
        })
    }

    pub fn set_delegate(&self, delegate: Arc<dyn PtyDelegate>) {
        *lock(&self.delegate) = Some(delegate);
    }

    /// Stop all callbacks; a delegate must be cleared or deregistered before it goes away
    pub fn clear_delegate(&self) {
        *lock(&self.delegate) = None;
    }

    fn delegate(&self) -> Option<Arc<dyn PtyDelegate>> {
        lock(&self.delegate).clone()
    }

    /// Start `command` on a new pty and hand the session to its scheduler
    ///
    /// A size requested with [`Self::set_size`] before launch replaces the
    /// command's initial size. On failure nothing is retained and the session
    /// can be launched again.
    pub fn launch(&self, command: ChildBuilder, is_utf8: bool) -> Result<()> {
        let scheduler = self.scheduler.upgrade().ok_or(SessionError::SchedulerClosed)?;
        let this = self.this.upgrade().ok_or(SessionError::SchedulerClosed)?;

        let mut io = lock(&self.io);
        if io.pid.is_some() {
            return Err(SessionError::AlreadyLaunched);
        }

        let size = io.pending_size.unwrap_or_else(|| command.initial_size()).clamped();
        let path = command.program().to_string_lossy().into_owned();
        let command_line = command.command_line();

        let (pty, pid) = command.size(size).utf8(is_utf8).spawn()?.into_parts();
        if let Err(e) = pty.set_nonblocking(true) {
            let _ = signal_group(pid, Signal::SIGKILL);
            let _ = ptytask_pty::wait(pid);
            return Err(e.into());
        }

        info!(pid = pid.as_raw(), fd = pty.as_raw_fd(), tty = pty.slave_path(), command = %command_line, "session launched");
        io.tty = Some(pty.slave_path().to_string());
        io.pty = Some(pty);
        io.pid = Some(pid);
        io.path = Some(path);
        io.command = Some(command_line);
        io.size = Some(size);
        io.pending_size = None;
        io.utf8 = is_utf8;
        drop(io);

        scheduler.register(this);
        Ok(())
    }

    /// Queue bytes for the child; never blocks
    ///
    /// Ignored once the pipe is broken or the session is stopping.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() || self.has_broken_pipe() || self.stop_requested.load(Ordering::Acquire)
        {
            return;
        }
        lock(&self.writes).push(Lane::User, data);
        self.wake();
    }

    pub fn wants_read(&self) -> bool {
        lock(&self.io).pty.is_some()
    }

    pub fn wants_write(&self) -> bool {
        let writes = lock(&self.writes);
        let io = lock(&self.io);
        io.pty.is_some() && !writes.is_empty() && !self.has_broken_pipe()
    }

    /// Whether the pending input is small enough to accept more coprocess output
    pub fn write_buffer_has_room(&self) -> bool {
        lock(&self.writes).has_room()
    }

    /// Read one chunk from the pty and forward it
    ///
    /// Bytes go to the log, then the coprocess, then the delegate (skipped
    /// while a muted coprocess is attached). End-of-stream or a descriptor
    /// error marks the pipe broken and schedules teardown.
    pub fn process_read(&self) -> ReadOutcome {
        let mut buf = vec![0u8; self.config.read_chunk_size];
        let result = {
            let io = lock(&self.io);
            match io.pty.as_ref() {
                Some(pty) => pty.read(&mut buf),
                None => return ReadOutcome::Closed,
            }
        };

        match result {
            Ok(0) => {
                debug!("pty reached end of stream");
                self.mark_broken_pipe();
                ReadOutcome::Closed
            }
            Ok(n) => {
                trace!(bytes = n, "read from pty");
                self.dispatch_output(&buf[..n]);
                ReadOutcome::Data(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                ReadOutcome::Idle
            }
            Err(e) => {
                // Linux reports a hung-up pty master as EIO.
                if e.raw_os_error() == Some(libc::EIO) {
                    debug!("pty hung up");
                } else {
                    warn!(error = %e, "pty read failed");
                }
                self.mark_broken_pipe();
                ReadOutcome::Closed
            }
        }
    }

    fn dispatch_output(&self, data: &[u8]) {
        self.has_output.store(true, Ordering::Release);
        lock(&self.log).write(data);

        let muted = match lock(&self.coprocess).as_mut() {
            Some(coprocess) => {
                coprocess.queue_input(data);
                coprocess.is_muted()
            }
            None => false,
        };
        if !muted {
            if let Some(delegate) = self.delegate() {
                delegate.on_read_bytes(data);
            }
        }
    }

    /// Write as much pending input as the pty accepts
    pub fn process_write(&self) {
        let result = {
            let mut writes = lock(&self.writes);
            let io = lock(&self.io);
            let Some(pty) = io.pty.as_ref() else {
                return;
            };
            if self.has_broken_pipe() {
                return;
            }
            writes.drain_with(|chunk| pty.write(chunk))
        };

        match result {
            Ok(0) => {}
            Ok(n) => trace!(bytes = n, "wrote to pty"),
            Err(e) => {
                warn!(error = %e, "pty write failed");
                self.mark_broken_pipe();
            }
        }
    }

    fn mark_broken_pipe(&self) {
        self.stop_requested.store(true, Ordering::Release);
        if !self.broken_pipe.swap(true, Ordering::AcqRel) {
            if let Some(delegate) = self.delegate() {
                delegate.on_broken_pipe();
            }
        }
    }

    pub fn has_broken_pipe(&self) -> bool {
        self.broken_pipe.load(Ordering::Acquire)
    }

    /// Whether the child has printed anything yet
    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::Acquire)
    }

    /// Resize the terminal
    ///
    /// Before launch the size is kept for `launch`; after teardown this does
    /// nothing.
    pub fn set_size(&self, cols: u16, rows: u16) {
        let size = WindowSize::new(cols, rows).clamped();
        let mut io = lock(&self.io);
        if io.pid.is_none() {
            io.pending_size = Some(size);
            return;
        }
        let Some(pty) = io.pty.as_ref() else {
            return;
        };
        match pty.set_window_size(size) {
            Ok(()) => {
                debug!(cols = size.cols, rows = size.rows, "pty resized");
                io.size = Some(size);
            }
            Err(e) => warn!(error = %e, "failed to resize pty"),
        }
    }

    /// Current size, or the size queued for launch
    ///
    /// While the pty is open this is what the terminal reports, so it also
    /// follows a child that resizes itself with `stty`.
    pub fn size(&self) -> Option<WindowSize> {
        let io = lock(&self.io);
        io.pty
            .as_ref()
            .and_then(|pty| pty.window_size().ok())
            .or(io.size)
            .or(io.pending_size)
    }

    /// Send signal number `signo` to the child's process group
    ///
    /// Does nothing, successfully, when there is no live child.
    pub fn send_signal(&self, signo: i32) -> Result<()> {
        let signal = Signal::try_from(signo).map_err(|_| SessionError::InvalidSignal(signo))?;
        let io = lock(&self.io);
        match io.pid {
            Some(pid) if !io.reaped => {
                debug!(pid = pid.as_raw(), %signal, "signalling child");
                signal_group(pid, signal).map_err(SessionError::Signal)
            }
            _ => {
                debug!(%signal, "no running child, signal not sent");
                Ok(())
            }
        }
    }

    /// Ask the child to hang up and tear the session down
    ///
    /// Returns immediately; `on_deregistered` reports completion. Repeated
    /// calls and calls on an unlaunched session do nothing.
    pub fn stop(&self) {
        let io = lock(&self.io);
        let Some(pid) = io.pid else {
            return;
        };
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if !io.reaped {
            debug!(pid = pid.as_raw(), "stopping session");
            let _ = signal_group(pid, Signal::SIGHUP);
        }
        drop(io);
        self.wake();
    }

    /// Name of the foreground job, cached until `force_refresh`
    pub fn current_job(&self, force_refresh: bool) -> String {
        let pgid = self.foreground_group();
        lock(&self.jobs).resolve_job(pgid, force_refresh)
    }

    /// Working directory of the foreground job, cached like [`Self::current_job`]
    pub fn working_directory(&self, force_refresh: bool) -> Option<String> {
        let pgid = self.foreground_group();
        lock(&self.jobs).resolve_working_directory(pgid, force_refresh)
    }

    fn foreground_group(&self) -> Option<Pid> {
        lock(&self.io)
            .pty
            .as_ref()
            .and_then(Pty::foreground_process_group)
    }

    pub fn logging_start(&self, path: &Path) -> Result<()> {
        lock(&self.log).start(path)
    }

    pub fn logging_stop(&self) {
        lock(&self.log).stop();
    }

    pub fn is_logging(&self) -> bool {
        lock(&self.log).is_active()
    }

    /// Append bytes that did not come from the pty to the session log
    pub fn log_data(&self, data: &[u8]) {
        lock(&self.log).write(data);
    }

    /// Attach a coprocess
    ///
    /// With one already attached the new coprocess is killed and the existing
    /// one is left alone.
    pub fn set_coprocess(&self, coprocess: Coprocess) -> Result<()> {
        {
            let mut slot = lock(&self.coprocess);
            if slot.is_some() {
                return Err(SessionError::AlreadyAttached);
            }
            if self.teardown_started.load(Ordering::Acquire) {
                return Err(SessionError::NotRunning);
            }
            info!(pid = coprocess.pid(), command = coprocess.command(), "coprocess attached");
            *slot = Some(coprocess);
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_coprocess_status_change();
        }
        self.wake();
        Ok(())
    }

    pub fn coprocess_command(&self) -> Option<String> {
        lock(&self.coprocess).as_ref().map(|c| c.command().to_string())
    }

    pub fn has_coprocess(&self) -> bool {
        lock(&self.coprocess).is_some()
    }

    pub fn has_muted_coprocess(&self) -> bool {
        lock(&self.coprocess).as_ref().is_some_and(Coprocess::is_muted)
    }

    /// Stop and detach the coprocess, discarding its unwritten output
    ///
    /// Returns without waiting for it to exit; the scheduler reaps it.
    pub fn stop_coprocess(&self) {
        let coprocess = lock(&self.coprocess).take();
        self.detach_coprocess(coprocess, true);
        self.wake();
    }

    fn detach_coprocess(&self, coprocess: Option<Coprocess>, discard_output: bool) {
        let Some(mut coprocess) = coprocess else {
            return;
        };
        if discard_output {
            lock(&self.writes).clear_lane(Lane::Coprocess);
        }
        info!(pid = coprocess.pid(), command = coprocess.command(), "coprocess detached");
        if !coprocess.terminate() {
            lock(&self.retired).push(coprocess);
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_coprocess_status_change();
        }
    }

    /// Move coprocess output into the child's input queue
    pub(crate) fn process_coprocess_read(&self) {
        let mut buf = vec![0u8; self.config.read_chunk_size];
        let mut slot = lock(&self.coprocess);
        let Some(coprocess) = slot.as_mut() else {
            return;
        };
        let mut writes = lock(&self.writes);
        if !writes.has_room() {
            return;
        }

        match coprocess.read_output(&mut buf) {
            Ok(0) => {
                // Output already read still reaches the child.
                drop(writes);
                let finished = slot.take();
                drop(slot);
                self.detach_coprocess(finished, false);
            }
            Ok(n) => {
                trace!(bytes = n, "read from coprocess");
                writes.push(Lane::Coprocess, &buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "coprocess read failed");
                drop(writes);
                let failed = slot.take();
                drop(slot);
                self.detach_coprocess(failed, true);
            }
        }
    }

    /// Feed buffered pty output to the coprocess
    pub(crate) fn process_coprocess_write(&self) {
        let mut slot = lock(&self.coprocess);
        let Some(coprocess) = slot.as_mut() else {
            return;
        };
        if let Err(e) = coprocess.flush_input() {
            warn!(error = %e, "coprocess write failed");
            let failed = slot.take();
            drop(slot);
            self.detach_coprocess(failed, true);
        }
    }

    pub(crate) fn poll_targets(&self) -> PollTargets {
        let coprocess = lock(&self.coprocess);
        let writes = lock(&self.writes);
        let io = lock(&self.io);

        let master = io.pty.as_ref().map(AsRawFd::as_raw_fd);
        PollTargets {
            master,
            want_write: master.is_some() && !writes.is_empty() && !self.has_broken_pipe(),
            coprocess_out: coprocess
                .as_ref()
                .filter(|_| writes.has_room())
                .map(Coprocess::output_fd),
            coprocess_in: coprocess.as_ref().and_then(Coprocess::input_fd),
        }
    }

    /// Reap detached coprocesses that have exited; true when none are left
    fn reap_retired(&self) -> bool {
        let mut retired = lock(&self.retired);
        retired.retain_mut(|coprocess| !coprocess.try_reap());
        retired.is_empty()
    }

    /// Run the state machine one step; true once the session is deregistered
    pub(crate) fn advance(&self, now: Instant) -> bool {
        if self.deregistered.load(Ordering::Acquire) {
            return true;
        }
        self.reap_retired();
        if !self.teardown_started.load(Ordering::Acquire) {
            if !self.stop_requested.load(Ordering::Acquire) && !self.child_exited() {
                return false;
            }
            self.begin_teardown();
        }
        if self.try_reap(now) {
            self.finish();
            return true;
        }
        false
    }

    /// Check for an exited child without consuming its output first
    fn child_exited(&self) -> bool {
        let mut io = lock(&self.io);
        let Some(pid) = io.pid else {
            return false;
        };
        if io.reaped {
            return true;
        }
        match try_wait(pid) {
            Ok(Some(status)) => {
                info!(pid = pid.as_raw(), %status, "child exited");
                io.status = Some(status);
                io.reaped = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "child cannot be waited for");
                io.reaped = true;
                true
            }
        }
    }

    /// Release everything except the child's pid; runs once
    fn begin_teardown(&self) {
        if self.teardown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_requested.store(true, Ordering::Release);

        self.drain_output();

        let coprocess = lock(&self.coprocess).take();
        self.detach_coprocess(coprocess, true);
        lock(&self.writes).clear();

        {
            let mut io = lock(&self.io);
            if let Some(pty) = io.pty.take() {
                debug!(fd = pty.as_raw_fd(), "closing pty master");
            }
            if !io.reaped {
                io.reap_deadline = Some(Instant::now() + self.config.termination_grace());
            }
        }

        lock(&self.log).stop();
    }

    /// Forward what the child already printed before the master closes
    fn drain_output(&self) {
        let mut drained = 0;
        while drained < DRAIN_LIMIT {
            match self.process_read() {
                ReadOutcome::Data(n) => drained += n,
                ReadOutcome::Closed => break,
                ReadOutcome::Idle => {
                    if !self.wait_readable() {
                        break;
                    }
                }
            }
        }
        if drained > 0 {
            debug!(bytes = drained, "drained pty before close");
        }
    }

    fn wait_readable(&self) -> bool {
        let io = lock(&self.io);
        let Some(pty) = io.pty.as_ref() else {
            return false;
        };
        let mut fds = [PollFd::new(pty.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::from(DRAIN_WAIT_MS)), Ok(n) if n > 0)
    }

    /// Reap the child, escalating to SIGKILL once the grace period passes
    fn try_reap(&self, now: Instant) -> bool {
        let mut io = lock(&self.io);
        let Some(pid) = io.pid else {
            return true;
        };
        if io.reaped {
            return true;
        }

        match try_wait(pid) {
            Ok(Some(status)) => {
                info!(pid = pid.as_raw(), %status, "child reaped");
                io.status = Some(status);
                io.reaped = true;
                true
            }
            Ok(None) => {
                let grace = self.config.termination_grace();
                let deadline = *io.reap_deadline.get_or_insert(now + grace);
                if now < deadline {
                    return false;
                }
                if !io.killed {
                    warn!(pid = pid.as_raw(), "child ignored hangup, sending SIGKILL");
                    let _ = signal_group(pid, Signal::SIGKILL);
                    io.killed = true;
                    io.reap_deadline = Some(now + grace);
                    false
                } else {
                    warn!(pid = pid.as_raw(), "child survived SIGKILL, giving up on it");
                    io.reaped = true;
                    true
                }
            }
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "child already reaped elsewhere");
                io.reaped = true;
                true
            }
        }
    }

    /// Fire `on_deregistered` once and drop the delegate
    fn finish(&self) {
        if self.deregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.reap_retired() {
            // Dropping them waits for the SIGKILL already sent.
            let stragglers = std::mem::take(&mut *lock(&self.retired));
            debug!(count = stragglers.len(), "reaping killed coprocesses");
            drop(stragglers);
        }
        let delegate = lock(&self.delegate).take();
        info!(status = ?self.status(), "session deregistered");
        if let Some(delegate) = delegate {
            delegate.on_deregistered();
        }
    }

    /// Tear down synchronously; used when the scheduler shuts down
    pub(crate) fn shutdown(&self) {
        self.stop();
        self.begin_teardown();
        while !self.try_reap(Instant::now()) {
            thread::sleep(Duration::from_millis(10));
        }
        self.finish();
    }

    pub fn is_deregistered(&self) -> bool {
        self.deregistered.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.wake();
        }
    }

    /// Command line the child was launched with
    pub fn command(&self) -> Option<String> {
        lock(&self.io).command.clone()
    }

    /// Program path the child was launched with
    pub fn path(&self) -> Option<String> {
        lock(&self.io).path.clone()
    }

    /// Master descriptor while it is open
    pub fn fd(&self) -> Option<RawFd> {
        lock(&self.io).pty.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn pid(&self) -> Option<Pid> {
        lock(&self.io).pid
    }

    /// Exit status once the child has been reaped
    pub fn status(&self) -> Option<ExitStatus> {
        lock(&self.io).status
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn tty(&self) -> Option<String> {
        lock(&self.io).tty.clone()
    }

    pub fn is_utf8(&self) -> bool {
        lock(&self.io).utf8
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (coprocess, coprocess_muted) = {
            let slot = lock(&self.coprocess);
            (
                slot.as_ref().map(|c| c.command().to_string()),
                slot.as_ref().is_some_and(Coprocess::is_muted),
            )
        };
        let log_path = lock(&self.log)
            .path()
            .map(|p| p.to_string_lossy().into_owned());
        let io = lock(&self.io);
        let size = io.size.or(io.pending_size);

        SessionSnapshot {
            pid: io.pid.map(Pid::as_raw),
            fd: io.pty.as_ref().map(AsRawFd::as_raw_fd),
            tty: io.tty.clone(),
            path: io.path.clone(),
            command: io.command.clone(),
            cols: size.map(|s| s.cols),
            rows: size.map(|s| s.rows),
            utf8: io.utf8,
            exit_code: io.status.map(|s| s.code()),
            exit: io.status.map(|s| s.to_string()),
            broken_pipe: self.has_broken_pipe(),
            has_output: self.has_output(),
            log_path,
            coprocess,
            coprocess_muted,
            deregistered: self.is_deregistered(),
        }
    }
}
