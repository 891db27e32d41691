//! Readiness scheduler
//!
//! One background thread per [`Scheduler`] polls the pty masters and
//! coprocess pipes of every launched session, runs their read and write
//! passes, and advances their teardown. Sessions register themselves on
//! launch and are unregistered after `on_deregistered` fires. Control calls
//! from other threads nudge the loop through a wake socket.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::PtySession;

/// Self-pipe that interrupts `poll`
#[derive(Debug)]
struct Waker {
    rx: UnixStream,
    tx: UnixStream,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self { rx, tx })
    }

    fn wake(&self) {
        // A full socket already guarantees a wakeup.
        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "failed to wake scheduler"),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

/// State shared between the scheduler handle, its thread and its sessions
#[derive(Debug)]
pub(crate) struct Shared {
    sessions: Mutex<Vec<Arc<PtySession>>>,
    waker: Waker,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn register(&self, session: Arc<PtySession>) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
        self.wake();
    }

    pub(crate) fn unregister(&self, session: &Arc<PtySession>) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !Arc::ptr_eq(s, session));
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    fn sessions(&self) -> Vec<Arc<PtySession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_sessions(&self) -> Vec<Arc<PtySession>> {
        std::mem::take(&mut *self.sessions.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Owner of the background thread that drives sessions
///
/// Dropping the scheduler stops every session still registered and waits
/// for their children to be reaped.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SessionConfig,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the scheduler thread
    ///
    /// Fails with [`SessionError::Config`] when `config` does not validate.
    ///
    /// [`SessionError::Config`]: crate::SessionError::Config
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            sessions: Mutex::new(Vec::new()),
            waker: Waker::new()?,
            shutdown: AtomicBool::new(false),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            let config = config.clone();
            thread::Builder::new()
                .name("ptytask-scheduler".to_string())
                .spawn(move || run(shared, config))?
        };

        Ok(Self {
            shared,
            config,
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sessions that are launched and not yet deregistered
    pub fn session_count(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Master,
    CoprocessOut,
    CoprocessIn,
}

fn run(shared: Arc<Shared>, config: SessionConfig) {
    let timeout = PollTimeout::try_from(config.poll_interval()).unwrap_or(PollTimeout::MAX);
    debug!(poll_interval_ms = config.poll_interval_ms, "scheduler started");

    while !shared.shutdown.load(Ordering::Acquire) {
        let sessions = shared.sessions();

        let mut watched: Vec<(usize, Slot, RawFd, PollFlags)> = Vec::new();
        for (index, session) in sessions.iter().enumerate() {
            let targets = session.poll_targets();
            if let Some(fd) = targets.master {
                let mut flags = PollFlags::POLLIN;
                if targets.want_write {
                    flags |= PollFlags::POLLOUT;
                }
                watched.push((index, Slot::Master, fd, flags));
            }
            if let Some(fd) = targets.coprocess_out {
                watched.push((index, Slot::CoprocessOut, fd, PollFlags::POLLIN));
            }
            if let Some(fd) = targets.coprocess_in {
                watched.push((index, Slot::CoprocessIn, fd, PollFlags::POLLOUT));
            }
        }

        let ready = wait_for_readiness(&shared.waker, &watched, timeout);
        for (index, slot, revents) in ready {
            let session = &sessions[index];
            match slot {
                Slot::Master => {
                    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    {
                        session.process_read();
                    }
                    if revents.contains(PollFlags::POLLOUT) {
                        session.process_write();
                    }
                }
                Slot::CoprocessOut => session.process_coprocess_read(),
                Slot::CoprocessIn => session.process_coprocess_write(),
            }
        }

        let now = Instant::now();
        for session in &sessions {
            if session.advance(now) {
                shared.unregister(session);
            }
        }
    }

    let remaining = shared.take_sessions();
    debug!(sessions = remaining.len(), "scheduler stopping");
    for session in remaining {
        session.shutdown();
    }
}

/// Block in `poll` and report which watched descriptors are ready
fn wait_for_readiness(
    waker: &Waker,
    watched: &[(usize, Slot, RawFd, PollFlags)],
    timeout: PollTimeout,
) -> Vec<(usize, Slot, PollFlags)> {
    let mut fds = Vec::with_capacity(watched.len() + 1);
    fds.push(PollFd::new(waker.rx.as_fd(), PollFlags::POLLIN));
    for &(_, _, fd, flags) in watched {
        // SAFETY: masters are closed only on this thread, after this call
        // returns. A coprocess pipe closed concurrently by `stop_coprocess`
        // at worst reports POLLNVAL, which is ignored.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        fds.push(PollFd::new(fd, flags));
    }

    match poll(&mut fds, timeout) {
        Ok(_) | Err(Errno::EINTR) => {}
        Err(e) => {
            error!(error = %e, "poll failed");
            thread::sleep(std::time::Duration::from_millis(10));
            return Vec::new();
        }
    }

    if fds[0].revents().is_some_and(|r| !r.is_empty()) {
        waker.drain();
    }

    let ready: Vec<_> = watched
        .iter()
        .zip(&fds[1..])
        .filter_map(|(&(index, slot, _, _), pollfd)| {
            pollfd
                .revents()
                .filter(|r| !r.is_empty() && !r.contains(PollFlags::POLLNVAL))
                .map(|r| (index, slot, r))
        })
        .collect();
    trace!(watched = watched.len(), ready = ready.len(), "readiness pass");
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ChannelDelegate, SessionEvent};
    use crate::error::SessionError;
    use std::time::Duration;

    #[test]
    fn test_new_and_drop_idle_scheduler() {
        let scheduler = Scheduler::new(SessionConfig::default()).unwrap();
        assert_eq!(scheduler.session_count(), 0);
        assert_eq!(scheduler.config().poll_interval_ms, 50);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Scheduler::new(SessionConfig {
            read_chunk_size: 0,
            ..SessionConfig::default()
        })
        .unwrap_err();
        match err {
            SessionError::Config(e) => assert_eq!(e.field.as_deref(), Some("read_chunk_size")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_waker_coalesces() {
        let waker = Waker::new().unwrap();
        for _ in 0..10_000 {
            waker.wake();
        }
        waker.drain();
        let mut buf = [0u8; 1];
        let err = (&waker.rx).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_session_count_follows_lifecycle() {
        let scheduler = Scheduler::new(SessionConfig::default()).unwrap();
        let session = PtySession::new(&scheduler);
        assert_eq!(scheduler.session_count(), 0);

        session
            .launch(ptytask_pty::ChildBuilder::new("/bin/cat"), true)
            .unwrap();
        assert_eq!(scheduler.session_count(), 1);

        session.stop();
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.session_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(scheduler.session_count(), 0);
        assert!(session.is_deregistered());
    }

    #[test]
    fn test_drop_tears_down_running_sessions() {
        let scheduler = Scheduler::new(SessionConfig {
            termination_grace_ms: 100,
            ..SessionConfig::default()
        })
        .unwrap();
        let session = PtySession::new(&scheduler);
        let (delegate, events) = ChannelDelegate::channel();
        session.set_delegate(delegate);
        session
            .launch(
                ptytask_pty::ChildBuilder::new("/bin/sh")
                    .args(["-c", "trap '' HUP; echo armed; sleep 30"]),
                true,
            )
            .unwrap();

        // The trap must be in place before the hangup arrives.
        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !output.windows(5).any(|w| w == b"armed") && Instant::now() < deadline {
            if let Ok(SessionEvent::Output(data)) = events.recv_timeout(Duration::from_millis(50)) {
                output.extend_from_slice(&data);
            }
        }
        assert!(output.windows(5).any(|w| w == b"armed"));

        drop(scheduler);
        assert!(session.is_deregistered());
        assert_eq!(
            session.status(),
            Some(ptytask_pty::ExitStatus::Signaled(libc::SIGKILL))
        );
        assert_eq!(session.fd(), None);
    }
}
