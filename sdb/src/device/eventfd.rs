//! Linux eventfd notification handle.
//!
//! The rpmsg-sdb driver raises a slot's eventfd once the coprocessor has
//! filled the slot. The receiver polls it with a timeout, then reads the
//! 8-byte counter to clear it.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use rustix::event::{EventfdFlags, PollFd, PollFlags, Timespec, eventfd, poll};
use rustix::io::{Errno, read, write};

use super::{Notification, NotifyError, Wakeup};

/// An owned, close-on-exec, non-blocking eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Creates an eventfd with a zero counter.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by `eventfd(2)`.
    pub fn new() -> Result<Self, Errno> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self { fd })
    }

    /// Adds one to the counter, waking any waiter.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by `write(2)`.
    pub fn signal(&self) -> Result<(), Errno> {
        write(&self.fd, &1u64.to_ne_bytes())?;
        Ok(())
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn to_timespec(timeout: Duration) -> Timespec {
    // Field widths follow the platform's timespec.
    Timespec {
        tv_sec: timeout.as_secs().min(i32::MAX as u64) as _,
        tv_nsec: timeout.subsec_nanos() as _,
    }
}

impl Notification for EventFd {
    fn wait(&self, timeout: Duration) -> Result<Wakeup, NotifyError> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = match poll(&mut fds, Some(&to_timespec(timeout))) {
            Ok(n) => n,
            // A signal interrupted the wait; let the caller re-check its state.
            Err(Errno::INTR) => return Ok(Wakeup::TimedOut),
            Err(e) => return Err(NotifyError::Os(e)),
        };

        if ready == 0 {
            return Ok(Wakeup::TimedOut);
        }

        let revents = fds[0].revents();
        if revents.intersects(PollFlags::HUP | PollFlags::ERR | PollFlags::NVAL) {
            return Err(NotifyError::Closed);
        }
        Ok(Wakeup::Signaled)
    }

    fn drain(&self) -> Result<u64, NotifyError> {
        let mut buf = [0u8; 8];
        match read(&self.fd, &mut buf[..]) {
            Ok(0) => Err(NotifyError::Closed),
            Ok(_) => Ok(u64::from_ne_bytes(buf)),
            // Nothing pending
            Err(Errno::AGAIN) => Ok(0),
            Err(e) => Err(NotifyError::Os(e)),
        }
    }
}
