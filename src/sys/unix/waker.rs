//! Wakes a thread blocked in `poll(2)` from another thread.
//!
//! Backed by `eventfd(2)` where available, a non-blocking pipe elsewhere.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd {
    use super::*;

    /// Waker backed by `eventfd`.
    ///
    /// `eventfd` is effectively a 64 bit counter. All writes must be of 8
    /// bytes (64 bits) and are added to the count; reads reset it.
    #[derive(Debug)]
    pub(crate) struct Waker {
        fd: File,
    }

    impl Waker {
        pub(crate) fn new() -> io::Result<Waker> {
            let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
            let fd = syscall!(eventfd(0, flags))?;
            Ok(Waker {
                fd: unsafe { File::from_raw_fd(fd) },
            })
        }

        pub(crate) fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter is about to
                    // overflow, so reset it and wake again.
                    self.drain();
                    self.wake()
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
                Err(err) => Err(err),
            }
        }

        pub(crate) fn drain(&self) {
            let mut buf: [u8; 8] = [0; 8];
            let _ = (&self.fd).read(&mut buf);
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::eventfd::Waker;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod pipe {
    use super::*;

    /// Waker backed by a non-blocking pipe.
    #[derive(Debug)]
    pub(crate) struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub(crate) fn new() -> io::Result<Waker> {
            let mut fds = [-1; 2];
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                let flags = syscall!(fcntl(*fd, libc::F_GETFL))?;
                syscall!(fcntl(*fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
                syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
            Ok(Waker {
                receiver: unsafe { File::from_raw_fd(fds[0]) },
                sender: unsafe { File::from_raw_fd(fds[1]) },
            })
        }

        pub(crate) fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // The reading end is full; the poller will wake anyway.
                    Ok(())
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
                Err(err) => Err(err),
            }
        }

        pub(crate) fn drain(&self) {
            let mut buf = [0; 64];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    _ => break,
                }
            }
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) use self::pipe::Waker;
