//! PTY master allocation and control
//!
//! The master is held as a `File` so reads and writes go through `std::io`
//! and the descriptor is closed exactly once, when the `Pty` is dropped.
//!
//! Note: On macOS, posix_openpt() returns a master that rejects ioctl(TIOCSWINSZ)
//! with ENOTTY until the slave side has been opened. openpty() opens both ends
//! at once; the parent keeps the slave until the child has it, then releases it.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
#[cfg(target_os = "macos")]
use nix::pty::openpty;
#[cfg(target_os = "linux")]
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::size::WindowSize;

/// The master side of a pseudoterminal pair
#[derive(Debug)]
pub struct Pty {
    master: File,
    slave_path: String,
    /// Held open until the child has opened its own copy
    #[cfg(target_os = "macos")]
    slave: Option<OwnedFd>,
}

impl Pty {
    /// Allocate a new master/slave pair
    #[cfg(target_os = "linux")]
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(|e| Error::PtyCreation(format!("posix_openpt: {e}")))?;
        grantpt(&master).map_err(|e| Error::PtyCreation(format!("grantpt: {e}")))?;
        unlockpt(&master).map_err(|e| Error::PtyCreation(format!("unlockpt: {e}")))?;
        let slave_path =
            ptsname_r(&master).map_err(|e| Error::PtyCreation(format!("ptsname: {e}")))?;

        // SAFETY: into_raw_fd hands ownership of the descriptor to the File.
        let master = unsafe { File::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(master)) };
        let pty = Self { master, slave_path };
        pty.set_cloexec()?;
        Ok(pty)
    }

    /// Allocate a new master/slave pair
    #[cfg(target_os = "macos")]
    pub fn open() -> Result<Self> {
        let pair = openpty(None, None).map_err(|e| Error::PtyCreation(format!("openpty: {e}")))?;
        let slave_path = unsafe {
            let name = libc::ttyname(pair.slave.as_raw_fd());
            if name.is_null() {
                return Err(Error::PtyCreation("Failed to get slave path".to_string()));
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        };
        let pty = Self {
            master: File::from(pair.master),
            slave_path,
            slave: Some(pair.slave),
        };
        pty.set_cloexec()?;
        Ok(pty)
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Drop the parent's handle on the slave once the child owns it
    ///
    /// Without this the master never reports end-of-stream after the child exits.
    pub fn release_slave(&mut self) {
        #[cfg(target_os = "macos")]
        {
            self.slave = None;
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Keep the master out of every process exec'd after this point,
    /// including other sessions' children and coprocesses.
    fn set_cloexec(&self) -> Result<()> {
        fcntl(self.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(())
    }

    /// Set the terminal size; the kernel notifies the foreground group with SIGWINCH
    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        let ws = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call.
        let result =
            unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSWINSZ as libc::c_ulong, &ws) };
        if result == -1 {
            Err(Error::WindowSize(io::Error::last_os_error().to_string()))
        } else {
            Ok(())
        }
    }

    pub fn window_size(&self) -> Result<WindowSize> {
        // SAFETY: an all-zero winsize is a valid value.
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes into the winsize struct we own.
        let result =
            unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
        if result == -1 {
            Err(Error::WindowSize(io::Error::last_os_error().to_string()))
        } else {
            Ok(WindowSize::from(ws))
        }
    }

    /// Foreground process group of the terminal, if any
    pub fn foreground_process_group(&self) -> Option<Pid> {
        // SAFETY: tcgetpgrp only inspects the descriptor.
        let pgrp = unsafe { libc::tcgetpgrp(self.as_raw_fd()) };
        (pgrp > 0).then(|| Pid::from_raw(pgrp))
    }

    /// Read child output. With O_NONBLOCK set this returns `WouldBlock` when empty.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.master).read(buf)
    }

    /// Write child input. With O_NONBLOCK set this may accept fewer bytes than given.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.master).write(buf)
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Open the slave side by path (runs in the forked child)
pub(crate) fn open_slave(path: &CStr) -> nix::Result<OwnedFd> {
    // SAFETY: path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        return Err(nix::errno::Errno::last());
    }
    // SAFETY: open returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Put the slave into the cooked mode a login terminal starts in
pub(crate) fn configure_slave(fd: BorrowedFd<'_>, utf8: bool) -> nix::Result<()> {
    let mut termios = termios::tcgetattr(fd)?;

    termios.input_flags |=
        InputFlags::ICRNL | InputFlags::IXON | InputFlags::IXANY | InputFlags::IMAXBEL | InputFlags::BRKINT;
    termios.input_flags.set(InputFlags::IUTF8, utf8);

    termios.output_flags |= OutputFlags::OPOST | OutputFlags::ONLCR;

    termios.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    termios.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD;

    termios.local_flags |= LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHOK
        | LocalFlags::ECHOKE
        | LocalFlags::ECHOCTL;

    termios::tcsetattr(fd, SetArg::TCSANOW, &termios)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_creation() {
        let pty = Pty::open().unwrap();
        assert!(!pty.slave_path().is_empty());
        #[cfg(target_os = "linux")]
        assert!(pty.slave_path().starts_with("/dev/pts/"));
        #[cfg(target_os = "macos")]
        assert!(pty.slave_path().starts_with("/dev/ttys"));
    }

    #[test]
    fn test_pty_window_size() {
        let pty = Pty::open().unwrap();
        pty.set_window_size(WindowSize::new(120, 40)).unwrap();
        let retrieved = pty.window_size().unwrap();
        assert_eq!(retrieved.cols, 120);
        assert_eq!(retrieved.rows, 40);
    }

    #[test]
    fn test_debug_shows_slave_path() {
        let pty = Pty::open().unwrap();
        assert!(format!("{pty:?}").contains(pty.slave_path()));
    }

    #[test]
    fn test_master_is_close_on_exec() {
        let pty = Pty::open().unwrap();
        let flags = fcntl(pty.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_nonblocking_read_on_idle_master() {
        let pty = Pty::open().unwrap();
        pty.set_nonblocking(true).unwrap();

        // Keep a slave open so the master does not report a hangup.
        let path = std::ffi::CString::new(pty.slave_path()).unwrap();
        let _slave = open_slave(&path).unwrap();

        let mut buf = [0u8; 16];
        let err = pty.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
