use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::time::Duration;

use super::{socket_addr, to_socket_addr, RawSocket};

/// Creates a non-blocking, close-on-exec stream socket for the family of
/// `addr`.
pub(crate) fn new_socket(addr: &SocketAddr) -> io::Result<RawSocket> {
    let family = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))?;

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let fd = {
        let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
        if let Err(err) = prepare_fd(fd) {
            close(fd);
            return Err(err);
        }
        fd
    };

    // No SIGPIPE when writing to a closed socket, on platforms without
    // MSG_NOSIGNAL.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if let Err(err) = set_nosigpipe(fd) {
        close(fd);
        return Err(err);
    }

    Ok(fd)
}

/// Puts an externally obtained descriptor in the mode the socket core
/// expects: non-blocking and close-on-exec.
pub(crate) fn prepare_fd(fd: RawSocket) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_nosigpipe(fd: RawSocket) -> io::Result<()> {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_NOSIGPIPE,
        &on as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(drop)
}

/// Starts a non-blocking connect. Returns `true` if the connection finished
/// immediately, `false` if it is in progress.
pub(crate) fn connect(fd: RawSocket, addr: &SocketAddr) -> io::Result<bool> {
    let (raw_addr, raw_addr_length) = socket_addr(addr);
    match syscall!(connect(fd, raw_addr.as_ptr(), raw_addr_length)) {
        Ok(_) => Ok(true),
        Err(err) => match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        },
    }
}

pub(crate) fn bind(fd: RawSocket, addr: &SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_length) = socket_addr(addr);
    syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length)).map(drop)
}

pub(crate) fn listen(fd: RawSocket, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(drop)
}

pub(crate) fn accept(fd: RawSocket) -> io::Result<RawSocket> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let stream = loop {
        match syscall!(accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC
        )) {
            Ok(stream) => break stream,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let stream = loop {
        match syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut())) {
            Ok(stream) => {
                syscall!(fcntl(stream, libc::F_SETFD, libc::FD_CLOEXEC))?;
                break stream;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    };

    Ok(stream)
}

/// Reads from the socket, retrying on `EINTR`.
pub(crate) fn recv(fd: RawSocket, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Writes to the socket, retrying on `EINTR`.
pub(crate) fn send(fd: RawSocket, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let flags = 0;

    loop {
        match syscall!(send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Half-closes the send side.
pub(crate) fn shutdown_send(fd: RawSocket) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(drop)
}

pub(crate) fn close(fd: RawSocket) {
    let _ = syscall!(close(fd));
}

/// Consumes the pending socket error, e.g. the outcome of a non-blocking
/// connect.
pub(crate) fn take_error(fd: RawSocket) -> io::Result<i32> {
    let mut error: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(error)
}

pub(crate) fn local_addr(fd: RawSocket) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub(crate) fn peer_addr(fd: RawSocket) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

fn set_opt<T>(
    fd: RawSocket,
    level: libc::c_int,
    name: libc::c_int,
    value: T,
) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const T as *const libc::c_void,
        size_of::<T>() as libc::socklen_t,
    ))
    .map(drop)
}

pub(crate) fn set_nodelay(fd: RawSocket, on: bool) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
}

pub(crate) fn set_keepalive(fd: RawSocket, on: bool, interval: Duration) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)?;
    if on {
        let secs = interval.as_secs().min(libc::c_int::MAX as u64) as libc::c_int;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, secs)?;
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        )))]
        let _ = secs;
    }
    Ok(())
}

pub(crate) fn set_v6only(fd: RawSocket, on: bool) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, on as libc::c_int)
}

pub(crate) fn set_buffer_sizes(
    fd: RawSocket,
    receive: Option<usize>,
    send: Option<usize>,
) -> io::Result<()> {
    if let Some(size) = receive {
        set_opt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            size.min(libc::c_int::MAX as usize) as libc::c_int,
        )?;
    }
    if let Some(size) = send {
        set_opt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            size.min(libc::c_int::MAX as usize) as libc::c_int,
        )?;
    }
    Ok(())
}
