#![allow(dead_code, unused_variables)]

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::RawSocket;

pub(crate) fn new_socket(addr: &SocketAddr) -> io::Result<RawSocket> {
    os_required!()
}

pub(crate) fn prepare_fd(fd: RawSocket) -> io::Result<()> {
    os_required!()
}

pub(crate) fn connect(fd: RawSocket, addr: &SocketAddr) -> io::Result<bool> {
    os_required!()
}

pub(crate) fn bind(fd: RawSocket, addr: &SocketAddr) -> io::Result<()> {
    os_required!()
}

pub(crate) fn listen(fd: RawSocket, backlog: i32) -> io::Result<()> {
    os_required!()
}

pub(crate) fn accept(fd: RawSocket) -> io::Result<RawSocket> {
    os_required!()
}

pub(crate) fn recv(fd: RawSocket, buf: &mut [u8]) -> io::Result<usize> {
    os_required!()
}

pub(crate) fn send(fd: RawSocket, buf: &[u8]) -> io::Result<usize> {
    os_required!()
}

pub(crate) fn shutdown_send(fd: RawSocket) -> io::Result<()> {
    os_required!()
}

pub(crate) fn close(fd: RawSocket) {
    os_required!()
}

pub(crate) fn take_error(fd: RawSocket) -> io::Result<i32> {
    os_required!()
}

pub(crate) fn local_addr(fd: RawSocket) -> io::Result<SocketAddr> {
    os_required!()
}

pub(crate) fn peer_addr(fd: RawSocket) -> io::Result<SocketAddr> {
    os_required!()
}

pub(crate) fn set_nodelay(fd: RawSocket, on: bool) -> io::Result<()> {
    os_required!()
}

pub(crate) fn set_keepalive(fd: RawSocket, on: bool, interval: Duration) -> io::Result<()> {
    os_required!()
}

pub(crate) fn set_v6only(fd: RawSocket, on: bool) -> io::Result<()> {
    os_required!()
}

pub(crate) fn set_buffer_sizes(
    fd: RawSocket,
    receive: Option<usize>,
    send: Option<usize>,
) -> io::Result<()> {
    os_required!()
}
