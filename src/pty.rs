//! PTY (pseudo-terminal) handling for shell communication.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use rustix::fs::{fcntl_setfl, OFlags};
use rustix::io::{read, write, Errno};
use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] rustix::io::Errno),
    #[error("Failed to grant PTY: {0}")]
    Grant(#[source] rustix::io::Errno),
    #[error("Failed to unlock PTY: {0}")]
    Unlock(#[source] rustix::io::Errno),
    #[error("Failed to get PTS name: {0}")]
    PtsName(#[source] rustix::io::Errno),
    #[error("Failed to fork: {0}")]
    Fork(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The master side of a PTY pair with a shell attached to the slave.
pub struct Pty {
    master: OwnedFd,
    child_pid: rustix::process::Pid,
}

impl Pty {
    /// Creates a new PTY and spawns the shell on its slave side. The child
    /// gets `TERM=kitty` and runs as a login shell.
    pub fn spawn(shell: &str) -> Result<Self, PtyError> {
        let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC)
            .map_err(PtyError::OpenMaster)?;

        // Non-blocking reads; the reader thread polls before reading.
        fcntl_setfl(&master, OFlags::NONBLOCK).map_err(|e| PtyError::Io(e.into()))?;

        grantpt(&master).map_err(PtyError::Grant)?;
        unlockpt(&master).map_err(PtyError::Unlock)?;

        let slave_name = ptsname(&master, Vec::new()).map_err(PtyError::PtsName)?;

        // SAFETY: the child branch only uses async-signal-safe functions.
        let fork_result = unsafe { libc::fork() };

        match fork_result {
            -1 => Err(PtyError::Fork(std::io::Error::last_os_error())),
            0 => Self::setup_child(&slave_name, shell),
            pid => {
                let child_pid = unsafe { rustix::process::Pid::from_raw_unchecked(pid) };
                Ok(Self { master, child_pid })
            }
        }
    }

    /// Child-side setup after fork: new session, slave PTY on stdio,
    /// `TERM=kitty`, exec the shell.
    fn setup_child(slave_name: &CString, shell: &str) -> ! {
        unsafe { libc::setsid() };

        let slave_fd = unsafe { libc::open(slave_name.as_ptr(), libc::O_RDWR) };
        if slave_fd < 0 {
            unsafe { libc::_exit(1) };
        }

        unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) };

        unsafe {
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
        }

        if slave_fd > 2 {
            unsafe { libc::close(slave_fd) };
        }

        let term_key = CString::new("TERM").unwrap();
        let term_value = CString::new("kitty").unwrap();
        unsafe { libc::setenv(term_key.as_ptr(), term_value.as_ptr(), 1) };

        let shell_cstr = CString::new(shell).expect("Invalid shell path");
        let shell_name = std::path::Path::new(shell)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sh");

        // Login shell convention: argv[0] prefixed with '-'.
        let login_shell = CString::new(format!("-{shell_name}")).expect("Invalid shell name");

        let args = [login_shell.as_ptr(), std::ptr::null()];

        unsafe {
            libc::execvp(shell_cstr.as_ptr(), args.as_ptr());
        }

        std::process::exit(1);
    }

    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn master_raw_fd(&self) -> i32 {
        self.master.as_raw_fd()
    }

    /// Reads from the master. Returns `Ok(0)` when no data is available.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        match read(&self.master, buf) {
            Ok(n) => Ok(n),
            Err(Errno::AGAIN) => Ok(0),
            Err(e) => Err(PtyError::Io(e.into())),
        }
    }

    /// Writes bytes to the master (input for the shell).
    pub fn write(&self, buf: &[u8]) -> Result<usize, PtyError> {
        write(&self.master, buf).map_err(|e| PtyError::Io(e.into()))
    }

    /// Relays the window size to the child via TIOCSWINSZ.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let result =
            unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };

        if result == -1 {
            Err(PtyError::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    pub fn child_pid(&self) -> rustix::process::Pid {
        self.child_pid
    }
}

// Dropping the Pty closes the master; the child sees EOF on its stdin and
// exits on its own. The core never signals it.
