//! Eventfd wrappers: the write interlock and the poll-loop wakeup channel.
//!
//! Both kernel objects are plain eventfds, used in two very different roles:
//!
//! - **Wakeup channel** — initial value 0 ("locked"). The shutdown path
//!   writes to it; the poll loop only watches it for `POLLIN` and discards
//!   the value.
//! - **Write interlock** — initial value 1 ("unlocked"), used as a counting
//!   semaphore of one. `read` acquires (blocking while the count is 0) and
//!   writing the captured value back releases. An eventfd rather than a
//!   mutex because the lock must be transferable to the agent as a file
//!   descriptor: once the agent owns the debugger connection, a dup of this
//!   eventfd lets it keep excluding the broker's DDM writers.

// Rust guideline compliant 2026-02

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{bail, Result};

/// Initial eventfd count for the wakeup channel (reads would block).
pub(crate) const EVENTFD_LOCKED: u32 = 0;

/// Initial eventfd count for the write interlock (one acquisition available).
pub(crate) const EVENTFD_UNLOCKED: u32 = 1;

/// A close-on-exec eventfd. Closed on drop.
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create an eventfd with the given initial count.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the eventfd; callers treat
    /// this as a fatal misconfiguration and abort broker start.
    pub(crate) fn new(initial: u32) -> Result<Self> {
        // SAFETY: eventfd takes no pointers; a negative return is an error.
        let raw = unsafe { libc::eventfd(initial, libc::EFD_CLOEXEC) };
        if raw < 0 {
            bail!("eventfd: {}", std::io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly-created descriptor we exclusively own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Add one to the eventfd count, unblocking any reader.
    ///
    /// Used by the shutdown path to kick the poll loop awake. Failures are
    /// ignored: the only caller runs during teardown, where there is nobody
    /// left to report to.
    pub(crate) fn signal(&self) {
        let value: u64 = 1;
        super::retry_eintr(|| {
            // SAFETY: writes exactly 8 bytes from a live u64.
            unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            }
        });
    }

    /// Read and discard the current count.
    ///
    /// Only meaningful once `poll` has reported `POLLIN`; the value carries
    /// no information, the wakeup is the point.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        super::retry_eintr(|| {
            // SAFETY: reads exactly 8 bytes into a live u64.
            unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            }
        });
    }
}

/// Scoped acquisition of the eventfd write interlock.
///
/// Construction reads the eventfd (blocking while another holder has it) and
/// captures the count; drop writes the captured count back. Every exit path
/// through a holder — success, early return, error propagation — releases,
/// because release lives in `Drop`.
pub(crate) struct ScopedEventFdLock<'a> {
    fd: &'a EventFd,
    value: u64,
}

impl<'a> ScopedEventFdLock<'a> {
    pub(crate) fn acquire(fd: &'a EventFd) -> Self {
        let mut value: u64 = 0;
        super::retry_eintr(|| {
            // SAFETY: reads exactly 8 bytes into a live u64; blocks while
            // the count is zero, which is the acquire semantics we want.
            unsafe {
                libc::read(
                    fd.raw(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            }
        });
        Self { fd, value }
    }
}

impl Drop for ScopedEventFdLock<'_> {
    fn drop(&mut self) {
        super::retry_eintr(|| {
            // SAFETY: writes exactly 8 bytes from the captured count.
            unsafe {
                libc::write(
                    self.fd.raw(),
                    &self.value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            }
        });
    }
}
