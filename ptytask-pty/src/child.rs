//! Child process management for PTY
//!
//! Spawns a program on the slave side of a fresh PTY as session leader with
//! the slave as its controlling terminal. Exec failures are reported back to
//! the parent over a close-on-exec socket, so `spawn` either returns a child
//! that is running the requested program or an error.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, execve, fork, setsid, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::pty::{configure_slave, open_slave, Pty};
use crate::size::WindowSize;

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code
    Exited(i32),
    /// Killed by this signal number
    Signaled(i32),
}

impl ExitStatus {
    /// Shell-style status: the exit code, or 128 + signal number
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signo) => 128 + signo,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Terminal states only; stopped or continued children yield `None`
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal as i32)),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signo) => write!(f, "killed by signal {signo}"),
        }
    }
}

/// Builder describing the program to run on a new PTY
#[derive(Debug, Clone)]
pub struct ChildBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<OsString>,
    size: WindowSize,
    utf8: bool,
}

impl ChildBuilder {
    /// Start from `program`, inheriting the current environment
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: std::env::vars_os().collect(),
            cwd: None,
            size: WindowSize::default(),
            utf8: true,
        }
    }

    /// The user's login shell (`$SHELL`, falling back to `/bin/sh`)
    pub fn default_shell() -> Self {
        let shell = std::env::var_os("SHELL").unwrap_or_else(|| OsString::from("/bin/sh"));
        Self::new(shell)
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set a variable, replacing any inherited value
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        let key = key.as_ref();
        self.env.retain(|(k, _)| k.as_os_str() != key);
        self.env.push((key.to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    pub fn env_remove<K: AsRef<OsStr>>(mut self, key: K) -> Self {
        let key = key.as_ref();
        self.env.retain(|(k, _)| k.as_os_str() != key);
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.env.clear();
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().as_os_str().to_os_string());
        self
    }

    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = size;
        self
    }

    /// Mark the line discipline as UTF-8 (IUTF8), which makes erase work per character
    pub fn utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn initial_size(&self) -> WindowSize {
        self.size
    }

    /// Program and arguments joined with spaces, for display
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Resolve a bare program name against `PATH` from the child's environment
    fn resolve_program(&self) -> OsString {
        if self.program.as_bytes().contains(&b'/') {
            return self.program.clone();
        }
        let path = self
            .env
            .iter()
            .find(|(k, _)| k.as_os_str() == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| OsString::from("/usr/bin:/bin"));
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
            .map(|candidate| candidate.into_os_string())
            .unwrap_or_else(|| self.program.clone())
    }

    /// Spawn the program on a new PTY
    pub fn spawn(self) -> Result<Child> {
        let nul = |e: std::ffi::NulError| Error::SpawnFailed(e.to_string());

        // Everything the child needs is allocated before fork.
        let program = CString::new(self.resolve_program().into_vec()).map_err(nul)?;
        let mut argv = vec![CString::new(self.program.as_bytes()).map_err(nul)?];
        for arg in &self.args {
            argv.push(CString::new(arg.as_bytes()).map_err(nul)?);
        }
        let envp = self
            .env
            .iter()
            .map(|(k, v)| {
                let mut pair = Vec::with_capacity(k.len() + 1 + v.len());
                pair.extend_from_slice(k.as_bytes());
                pair.push(b'=');
                pair.extend_from_slice(v.as_bytes());
                CString::new(pair)
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(nul)?;
        let cwd = self
            .cwd
            .as_ref()
            .map(|dir| CString::new(dir.as_bytes()))
            .transpose()
            .map_err(nul)?;

        let mut pty = Pty::open()?;
        pty.set_window_size(self.size.clamped())?;
        let slave_path = CString::new(pty.slave_path()).map_err(nul)?;

        let (mut status_rx, status_tx) = UnixStream::pair()?;

        // SAFETY: the child only performs descriptor setup and exec before
        // either replacing its image or calling _exit.
        match unsafe { fork() }.map_err(|e| Error::SpawnFailed(format!("fork: {e}")))? {
            ForkResult::Parent { child } => {
                drop(status_tx);
                pty.release_slave();

                let mut report = Vec::new();
                status_rx.read_to_end(&mut report)?;
                if let Some(bytes) = report.get(..4) {
                    let mut errno = [0u8; 4];
                    errno.copy_from_slice(bytes);
                    let _ = waitpid(child, None);
                    return Err(Error::Exec {
                        program: self.program.to_string_lossy().into_owned(),
                        source: io::Error::from_raw_os_error(i32::from_ne_bytes(errno)),
                    });
                }

                debug!("spawned {} as pid {} on {}", self.command_line(), child, pty.slave_path());
                Ok(Child { pty, pid: child })
            }
            ForkResult::Child => {
                let setup = ChildSetup {
                    program: &program,
                    argv: &argv,
                    envp: &envp,
                    cwd: cwd.as_deref(),
                    slave_path: &slave_path,
                    utf8: self.utf8,
                };
                setup.exec(status_tx.as_raw_fd())
            }
        }
    }
}

/// Pre-built arguments for the forked child
struct ChildSetup<'a> {
    program: &'a CStr,
    argv: &'a [CString],
    envp: &'a [CString],
    cwd: Option<&'a CStr>,
    slave_path: &'a CStr,
    utf8: bool,
}

impl ChildSetup<'_> {
    fn exec(&self, status_fd: RawFd) -> ! {
        if let Err(errno) = setsid() {
            fail(status_fd, errno);
        }

        let slave = match open_slave(self.slave_path) {
            Ok(fd) => fd,
            Err(errno) => fail(status_fd, errno),
        };
        let slave_raw = slave.as_raw_fd();

        // Note: On macOS, TIOCSCTTY is u32 but ioctl expects c_ulong
        // SAFETY: TIOCSCTTY takes no pointer argument.
        if unsafe { libc::ioctl(slave_raw, libc::TIOCSCTTY as libc::c_ulong, 0) } < 0 {
            fail(status_fd, Errno::last());
        }

        if let Err(errno) = configure_slave(slave.as_fd(), self.utf8) {
            fail(status_fd, errno);
        }

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if let Err(errno) = dup2(slave_raw, target) {
                fail(status_fd, errno);
            }
        }
        if slave_raw > libc::STDERR_FILENO {
            drop(slave);
        } else {
            // The descriptor is now one of stdio and must stay open.
            std::mem::forget(slave);
        }

        if let Some(dir) = self.cwd {
            // A missing directory is not fatal; the program starts where we are.
            let _ = chdir(dir);
        }

        for sig in [
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGQUIT,
            Signal::SIGTERM,
            Signal::SIGALRM,
            Signal::SIGPIPE,
            Signal::SIGTSTP,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
        ] {
            // SAFETY: installing SIG_DFL has no handler to race with.
            let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
        }
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        match execve(self.program, self.argv, self.envp) {
            Err(errno) => fail(status_fd, errno),
            Ok(never) => match never {},
        }
    }
}

/// Report `errno` to the parent and leave without running destructors
fn fail(status_fd: RawFd, errno: Errno) -> ! {
    let bytes = (errno as i32).to_ne_bytes();
    // SAFETY: write and _exit are async-signal-safe; bytes outlives the call.
    unsafe {
        libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(127)
    }
}

/// A child process attached to a PTY
#[derive(Debug)]
pub struct Child {
    pty: Pty,
    pid: Pid,
}

impl Child {
    pub fn pty(&self) -> &Pty {
        &self.pty
    }

    /// Split into the master and the pid so they can be released separately
    ///
    /// Dropping the `Pty` closes the master, which hangs up the child; the pid
    /// still has to be reaped with [`try_wait`] or [`wait`].
    pub fn into_parts(self) -> (Pty, Pid) {
        (self.pty, self.pid)
    }

    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        try_wait(self.pid)
    }

    pub fn wait(&self) -> Result<ExitStatus> {
        wait(self.pid)
    }

    /// Signal the child's process group
    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal_group(self.pid, sig)
    }
}

/// Reap `pid` if it has terminated, without blocking
pub fn try_wait(pid: Pid) -> Result<Option<ExitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => return Ok(ExitStatus::from_wait_status(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Block until `pid` terminates and reap it
pub fn wait(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = ExitStatus::from_wait_status(status) {
                    return Ok(exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Send `sig` to the process group led by `pid`
///
/// A group that no longer exists is not an error.
pub fn signal_group(pid: Pid, sig: Signal) -> Result<()> {
    match killpg(pid, sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("process group {} already gone, {} not delivered", pid, sig);
            Ok(())
        }
        Err(e) => {
            warn!("failed to send {} to process group {}: {}", sig, pid, e);
            Err(Error::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn read_until_eof(pty: &Pty) -> Vec<u8> {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match pty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10))
                }
                // EIO once the slave side is gone
                Err(_) => break,
            }
        }
        output
    }

    #[test]
    fn test_spawn_echo() {
        let child = ChildBuilder::new("/bin/echo").arg("test output").spawn().unwrap();
        child.pty().set_nonblocking(true).unwrap();

        let output = read_until_eof(child.pty());
        assert!(String::from_utf8_lossy(&output).contains("test output"));

        let status = child.wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_bare_program_name_is_found_on_path() {
        let child = ChildBuilder::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(3));
    }

    #[test]
    fn test_missing_program_is_an_exec_error() {
        let result = ChildBuilder::new("/nonexistent/definitely-not-here").spawn();
        match result {
            Err(Error::Exec { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT))
            }
            Err(other) => panic!("expected exec error, got {other}"),
            Ok(_) => panic!("spawn of a missing program succeeded"),
        }
    }

    #[test]
    fn test_env_and_cwd_reach_child() {
        let dir = tempfile::tempdir().unwrap();
        let child = ChildBuilder::new("/bin/sh")
            .args(["-c", "printf '%s:%s' \"$PTYTASK_MARKER\" \"$(pwd -P)\""])
            .env("PTYTASK_MARKER", "marker-42")
            .current_dir(dir.path())
            .spawn()
            .unwrap();
        child.pty().set_nonblocking(true).unwrap();

        let output = String::from_utf8_lossy(&read_until_eof(child.pty())).into_owned();
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(output, format!("marker-42:{}", expected_dir.display()));
        let _ = child.wait();
    }

    #[test]
    fn test_env_replaces_inherited_value() {
        let builder = ChildBuilder::new("/bin/true")
            .env("PTYTASK_DUP", "one")
            .env("PTYTASK_DUP", "two");
        let values: Vec<_> = builder
            .env
            .iter()
            .filter(|(k, _)| k.as_os_str() == "PTYTASK_DUP")
            .collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1, OsString::from("two"));
    }

    #[test]
    fn test_initial_size_is_visible_to_child() {
        let child = ChildBuilder::new("/bin/sh")
            .args(["-c", "stty size"])
            .size(WindowSize::new(100, 30))
            .spawn()
            .unwrap();
        child.pty().set_nonblocking(true).unwrap();

        let output = String::from_utf8_lossy(&read_until_eof(child.pty())).into_owned();
        assert!(output.contains("30 100"), "unexpected stty output: {output:?}");
        let _ = child.wait();
    }

    #[test]
    fn test_signal_group_terminates_child() {
        let child = ChildBuilder::new("/bin/sh").args(["-c", "sleep 30"]).spawn().unwrap();
        child.signal(Signal::SIGKILL).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status, ExitStatus::Signaled(libc::SIGKILL));
        assert_eq!(status.code(), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_signal_after_reap_is_not_an_error() {
        let child = ChildBuilder::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        child.wait().unwrap();
        assert!(child.signal(Signal::SIGTERM).is_ok());
    }

    #[test]
    fn test_try_wait_reports_running_child() {
        let child = ChildBuilder::new("/bin/sh").args(["-c", "sleep 30"]).spawn().unwrap();
        assert_eq!(child.try_wait().unwrap(), None);
        child.signal(Signal::SIGKILL).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_command_line_joins_arguments() {
        let builder = ChildBuilder::new("/bin/ls").args(["-l", "/tmp"]);
        assert_eq!(builder.command_line(), "/bin/ls -l /tmp");
        assert_eq!(builder.program(), OsStr::new("/bin/ls"));
    }
}
