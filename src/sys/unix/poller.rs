//! Per-socket-thread readiness waiting.
//!
//! Each socket worker owns one `Poller`. It waits for readiness on a single
//! descriptor with `poll(2)` and can be interrupted from another thread
//! through a waker descriptor included in the poll set.

use std::io;

use super::waker::Waker;
use super::{RawSocket, INVALID_SOCKET};

/// Readiness of a descriptor, with hangup and error conditions folded into
/// both directions: either way the next read or write will return 0 or fail.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

#[derive(Debug)]
pub(crate) struct Poller {
    waker: Waker,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            waker: Waker::new()?,
        })
    }

    /// Waits until `fd` is ready for any of the requested directions or the
    /// poller is interrupted. Pass [`INVALID_SOCKET`] to wait for the
    /// interrupt alone.
    ///
    /// Spurious returns with no readiness are expected; the caller re-checks
    /// its wait mask and calls again.
    pub(crate) fn wait(&self, fd: RawSocket, read: bool, write: bool) -> io::Result<Readiness> {
        use std::os::unix::io::AsRawFd;

        let mut events: libc::c_short = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }

        let mut fds = [
            libc::pollfd {
                fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.waker.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let (ptr, len) = if fd == INVALID_SOCKET {
            (&mut fds[1] as *mut libc::pollfd, 1)
        } else {
            (fds.as_mut_ptr(), 2)
        };

        loop {
            let res = unsafe { libc::poll(ptr, len as libc::nfds_t, -1) };
            if res >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if fds[1].revents != 0 {
            self.waker.drain();
        }

        let revents = fds[0].revents;
        Ok(Readiness {
            readable: revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            writable: revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0,
        })
    }

    /// Interrupts a concurrent or subsequent [`Poller::wait`].
    pub(crate) fn interrupt(&self) {
        let _ = self.waker.wake();
    }
}
