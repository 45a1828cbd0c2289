//! The IPv6-capable, non-blocking socket.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::event::{EventHandler, EventLoop};
use crate::layer::SocketInterface;
use crate::net::errc;
use crate::net::event::{change_socket_event_handler, remove_socket_events};
use crate::net::thread::{
    SocketShared, FLAG_KEEPALIVE, FLAG_NODELAY, WAIT_READ, WAIT_WRITE,
};
use crate::net::{
    AddressFamily, SocketDescriptor, SocketEventFlag, SocketEventFlags, SocketState, SourceId,
};
use crate::pool::ThreadPool;
use crate::sys::{self, INVALID_SOCKET};

/// An IPv6-capable, non-blocking TCP socket with edge-triggered socket
/// events.
///
/// Error codes are the POSIX socket error numbers, see `man 2 socket`,
/// `man 2 connect`, ...
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// Disables Nagle's algorithm.
    pub const FLAG_NODELAY: u8 = FLAG_NODELAY;
    /// Enables TCP keepalive.
    pub const FLAG_KEEPALIVE: u8 = FLAG_KEEPALIVE;

    /// Creates an idle socket bound to `event_loop`.
    ///
    /// The socket owns a worker thread, spawned from `pool` on the first
    /// operation needing it.
    pub fn new(
        pool: &ThreadPool,
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> io::Result<Socket> {
        Ok(Socket {
            shared: SocketShared::new(pool, event_loop, handler)?,
        })
    }

    /// Adopts a connected descriptor, e.g. one obtained from
    /// [`ListenSocket::fast_accept`](crate::net::ListenSocket::fast_accept)
    /// on another thread.
    pub fn from_descriptor(
        descriptor: SocketDescriptor,
        pool: &ThreadPool,
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> io::Result<Socket> {
        if !descriptor.is_valid() {
            return Err(io::Error::from_raw_os_error(errc::ENOTSOCK));
        }
        let fd = descriptor.detach() as sys::RawSocket;

        if let Err(err) = sys::tcp::prepare_fd(fd) {
            sys::tcp::close(fd);
            return Err(err);
        }

        let socket = Socket::new(pool, event_loop, handler)?;
        {
            let shared = Arc::clone(&socket.shared);
            let mut st = shared.state.lock().unwrap();
            st.fd = fd;
            st.state = SocketState::Connected;
            st.peer_host = sys::tcp::peer_addr(fd)
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default();
            st.waiting = WAIT_READ;
            shared.start(&mut st);
        }
        Ok(socket)
    }

    /// Starts connecting to the given host, given as name, IPv4 or IPv6
    /// address.
    ///
    /// Success only means that establishing the connection has started. Once
    /// it is fully established or has failed, a connection event gets sent
    /// with the error value indicating the outcome. If `host` is a name
    /// resolving to multiple addresses, candidates are tried in order with
    /// advisory `ConnectionNext` events in between.
    ///
    /// A host address event with the literal address is sent for every
    /// attempted candidate.
    pub fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()> {
        if host.is_empty() || port == 0 {
            return Err(io::Error::from_raw_os_error(errc::EINVAL));
        }

        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();
        if st.state != SocketState::None {
            return Err(io::Error::from_raw_os_error(errc::EISCONN));
        }

        st.state = SocketState::Connecting;
        st.family = family;
        st.host = host.to_owned();
        st.peer_host = host.to_owned();
        st.port = port;
        st.connect_pending = true;
        shared.start(&mut st);
        Ok(())
    }

    /// Reads data from the socket. A return of 0 bytes indicates EOF.
    ///
    /// Can be called after receiving a read event and thenceforth until it
    /// returns an error: [`WouldBlock`](io::ErrorKind::WouldBlock) means
    /// wait for the next read event, anything else means the socket has
    /// failed and should be closed. `EINTR` is handled internally.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = {
            let st = self.shared.state.lock().unwrap();
            if st.fd == INVALID_SOCKET {
                return Err(io::Error::from_raw_os_error(errc::ENOTCONN));
            }
            st.fd
        };

        match sys::tcp::recv(fd, buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    let mut st = self.shared.state.lock().unwrap();
                    if st.waiting & WAIT_READ == 0 {
                        st.waiting |= WAIT_READ;
                        self.shared.wake(&mut st);
                    }
                }
                Err(err)
            }
        }
    }

    /// Writes data to the socket. May write fewer bytes than requested.
    ///
    /// Same error contract as [`Socket::read`], with
    /// [`WouldBlock`](io::ErrorKind::WouldBlock) answered by the next write
    /// event.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = {
            let st = self.shared.state.lock().unwrap();
            if st.fd == INVALID_SOCKET {
                return Err(io::Error::from_raw_os_error(errc::ENOTCONN));
            }
            st.fd
        };

        match sys::tcp::send(fd, buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    let mut st = self.shared.state.lock().unwrap();
                    if st.waiting & WAIT_WRITE == 0 {
                        st.waiting |= WAIT_WRITE;
                        self.shared.wake(&mut st);
                    }
                }
                Err(err)
            }
        }
    }

    /// Signals the peer that no more data will be sent. Reading from the
    /// socket is unaffected and can still observe the peer's EOF.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        if st.fd == INVALID_SOCKET {
            return Err(io::Error::from_raw_os_error(errc::ENOTCONN));
        }
        sys::tcp::shutdown_send(st.fd)?;
        if st.state == SocketState::Connected {
            st.state = SocketState::ShutDown;
        }
        st.waiting &= !WAIT_WRITE;
        st.triggered &= !WAIT_WRITE;
        Ok(())
    }

    /// Closes the socket, dropping the handler association and removing
    /// pending events.
    pub fn close(&self) {
        let shared = &self.shared;
        let handler = {
            let mut st = shared.state.lock().unwrap();
            if st.fd != INVALID_SOCKET {
                if st.task.is_some() {
                    // The worker may be polling the descriptor; it performs
                    // the actual close.
                    let fd = st.fd;
                    st.fds_to_close.push(fd);
                } else {
                    sys::tcp::close(st.fd);
                }
                st.fd = INVALID_SOCKET;
            }
            st.host.clear();
            st.connect_pending = false;
            st.state = SocketState::Closed;
            st.waiting = 0;
            st.triggered = 0;
            let handler = st.handler.take();
            shared.wake(&mut st);
            handler
        };
        if let Some(handler) = handler {
            remove_socket_events(&shared.event_loop, &handler, shared.source);
        }
    }

    /// Current state of the socket.
    pub fn state(&self) -> SocketState {
        self.shared.state.lock().unwrap().state
    }

    /// Whether the socket is connected, possibly half-closed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SocketState::Connected | SocketState::ShuttingDown | SocketState::ShutDown
        )
    }

    /// Changes the associated event handler.
    ///
    /// Pending events are rewritten to the new handler, or deleted if there
    /// is no new handler. The new handler is assumed to be waiting on read
    /// and write events: if the socket is in a readable or writable state
    /// and no such event is pending or armed, one is synthesized. Events in
    /// `retrigger_block` are always removed and never resent.
    pub fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        retrigger_block: SocketEventFlags,
    ) {
        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();

        let old = st.handler.take();
        let pending = match &old {
            Some(old_handler) => change_socket_event_handler(
                &shared.event_loop,
                old_handler,
                handler.as_ref(),
                shared.source,
                retrigger_block,
            ),
            None => SocketEventFlags::EMPTY,
        };
        st.handler = handler;

        if st.handler.is_some() {
            if st.state == SocketState::Connected
                && st.waiting & WAIT_WRITE == 0
                && !pending.contains(SocketEventFlag::Connection)
                && !pending.contains(SocketEventFlag::Write)
                && !retrigger_block.contains(SocketEventFlag::Write)
            {
                st.triggered &= !WAIT_WRITE;
                shared.send_event(&st, SocketEventFlag::Write, 0);
            }
            if matches!(st.state, SocketState::Connected | SocketState::ShutDown)
                && st.waiting & WAIT_READ == 0
                && !pending.contains(SocketEventFlag::Read)
                && !retrigger_block.contains(SocketEventFlag::Read)
            {
                st.triggered &= !WAIT_READ;
                shared.send_event(&st, SocketEventFlag::Read, 0);
            }
        }
    }

    /// The hostname passed to connect, or the peer address of an accepted
    /// socket.
    pub fn peer_host(&self) -> String {
        self.shared.state.lock().unwrap().peer_host.clone()
    }

    /// Remote address of a connected socket.
    pub fn peer_ip(&self) -> io::Result<IpAddr> {
        let fd = self.raw_fd()?;
        sys::tcp::peer_addr(fd).map(|addr| addr.ip())
    }

    /// Remote port of a connected socket.
    pub fn peer_port(&self) -> io::Result<u16> {
        let fd = self.raw_fd()?;
        sys::tcp::peer_addr(fd).map(|addr| addr.port())
    }

    /// Local address of a connected socket.
    pub fn local_ip(&self) -> io::Result<IpAddr> {
        let fd = self.raw_fd()?;
        sys::tcp::local_addr(fd).map(|addr| addr.ip())
    }

    /// Local port of a connected socket.
    pub fn local_port(&self) -> io::Result<u16> {
        let fd = self.raw_fd()?;
        sys::tcp::local_addr(fd).map(|addr| addr.port())
    }

    /// Binds the socket to a specific local IP before connecting.
    pub fn bind(&self, address: IpAddr) {
        self.shared.state.lock().unwrap().bind_addr = Some(address);
    }

    /// Currently enabled flags.
    pub fn flags(&self) -> u8 {
        self.shared.state.lock().unwrap().flags
    }

    /// Enables or disables the passed flags.
    pub fn set_flag(&self, flags: u8, enable: bool) {
        let mut st = self.shared.state.lock().unwrap();
        let new = if enable { st.flags | flags } else { st.flags & !flags };
        st.flags = new;
        if st.fd != INVALID_SOCKET {
            crate::net::thread::apply_options(&st, st.fd);
        }
    }

    /// Sets the entire mask of enabled flags, disabling all others.
    pub fn set_flags(&self, flags: u8) {
        let mut st = self.shared.state.lock().unwrap();
        st.flags = flags;
        if st.fd != INVALID_SOCKET {
            crate::net::thread::apply_options(&st, st.fd);
        }
    }

    /// Sets the interval between TCP keepalive packets.
    ///
    /// The default interval is 2 hours. Values smaller than the minimum of
    /// 5 minutes are ignored.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        if interval < Duration::from_secs(5 * 60) {
            return;
        }
        let mut st = self.shared.state.lock().unwrap();
        st.keepalive_interval = interval;
        if st.fd != INVALID_SOCKET {
            crate::net::thread::apply_options(&st, st.fd);
        }
    }

    /// Sets the socket's receive and send buffer sizes (`SO_RCVBUF` and
    /// `SO_SNDBUF`); `None` leaves the respective size at the system
    /// default.
    pub fn set_buffer_sizes(&self, receive: Option<usize>, send: Option<usize>) -> io::Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        st.buffer_sizes = [receive, send];
        if st.fd != INVALID_SOCKET {
            sys::tcp::set_buffer_sizes(st.fd, receive, send)?;
        }
        Ok(())
    }

    /// The id this socket stamps on its events.
    pub fn source_id(&self) -> SourceId {
        self.shared.source
    }

    fn raw_fd(&self) -> io::Result<sys::RawSocket> {
        let st = self.shared.state.lock().unwrap();
        if st.fd == INVALID_SOCKET {
            return Err(io::Error::from_raw_os_error(errc::ENOTCONN));
        }
        Ok(st.fd)
    }
}

impl SocketInterface for Socket {
    fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()> {
        Socket::connect(self, host, port, family)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Socket::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Socket::write(self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        Socket::shutdown(self)
    }

    /// On an ordinary socket this is a no-op: there are no layers below
    /// which could hold back an EOF.
    fn shutdown_read(&self) -> io::Result<()> {
        Ok(())
    }

    fn state(&self) -> SocketState {
        Socket::state(self)
    }

    fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        retrigger_block: SocketEventFlags,
    ) {
        Socket::set_event_handler(self, handler, retrigger_block)
    }

    fn peer_host(&self) -> String {
        Socket::peer_host(self)
    }

    fn peer_port(&self) -> io::Result<u16> {
        Socket::peer_port(self)
    }

    fn source_id(&self) -> SourceId {
        Socket::source_id(self)
    }

    fn root_id(&self) -> SourceId {
        Socket::source_id(self)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
        let mut st = self.shared.state.lock().unwrap();
        st.quit = true;
        self.shared.wake(&mut st);
        if let Some(mut task) = st.task.take() {
            // The worker cleans up on its own once it observes quit.
            task.detach();
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("Socket")
            .field("state", &st.state)
            .field("peer_host", &st.peer_host)
            .finish()
    }
}
