#![allow(dead_code, unused_variables)]

use std::io;

pub(crate) mod tcp;

/// Raw socket handle on unsupported targets.
pub(crate) type RawSocket = i32;

pub(crate) const INVALID_SOCKET: RawSocket = -1;

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

#[derive(Debug)]
pub(crate) struct Poller {}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        os_required!()
    }

    pub(crate) fn wait(&self, fd: RawSocket, read: bool, write: bool) -> io::Result<Readiness> {
        os_required!()
    }

    pub(crate) fn interrupt(&self) {
        os_required!()
    }
}
