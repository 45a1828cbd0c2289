//! Listen sockets.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::event::{EventHandler, EventLoop};
use crate::net::errc;
use crate::net::event::{change_socket_event_handler, remove_socket_events};
use crate::net::thread::{SocketShared, WAIT_ACCEPT};
use crate::net::{AddressFamily, Socket, SocketDescriptor, SocketEventFlags, SourceId};
use crate::pool::ThreadPool;
use crate::sys::{self, INVALID_SOCKET};

/// State of a [`ListenSocket`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ListenSocketState {
    /// How the socket starts out.
    #[default]
    None,
    /// Only in listening state you can get a connection event.
    Listening,
}

/// A simple listen socket.
///
/// Whenever an incoming connection is pending, a socket event with the
/// `Connection` flag is sent. Call [`ListenSocket::accept`] (or
/// [`ListenSocket::fast_accept`]) to accept it.
pub struct ListenSocket {
    shared: Arc<SocketShared>,
}

impl ListenSocket {
    /// Creates an idle listen socket bound to `event_loop`.
    pub fn new(
        pool: &ThreadPool,
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> io::Result<ListenSocket> {
        Ok(ListenSocket {
            shared: SocketShared::new(pool, event_loop, handler)?,
        })
    }

    /// Starts listening.
    ///
    /// With a port of 0 the operating system decides on a port; query it
    /// with [`ListenSocket::local_port`] afterwards. A previously set
    /// [`ListenSocket::bind`] address restricts the listening address; its
    /// family must agree with `family`.
    pub fn listen(&self, family: AddressFamily, port: u16) -> io::Result<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();
        if st.listen_state != ListenSocketState::None {
            return Err(io::Error::from_raw_os_error(errc::EALREADY));
        }

        let ip = match (st.bind_addr, family) {
            (Some(ip), AddressFamily::Unknown) => ip,
            (Some(ip), AddressFamily::Ipv4) if ip.is_ipv4() => ip,
            (Some(ip), AddressFamily::Ipv6) if ip.is_ipv6() => ip,
            (Some(_), _) => return Err(io::Error::from_raw_os_error(errc::EINVAL)),
            (None, AddressFamily::Ipv4) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (None, _) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let addr = SocketAddr::new(ip, port);

        let fd = sys::tcp::new_socket(&addr)?;
        if addr.is_ipv6() {
            let _ = sys::tcp::set_v6only(fd, true);
        }
        if let Err(err) = sys::tcp::bind(fd, &addr).and_then(|()| sys::tcp::listen(fd, 64)) {
            sys::tcp::close(fd);
            return Err(err);
        }

        st.fd = fd;
        st.listen_state = ListenSocketState::Listening;
        st.waiting = WAIT_ACCEPT;
        shared.start(&mut st);
        Ok(())
    }

    /// Accepts a pending connection as a connected [`Socket`] bound to the
    /// same loop, with `handler` installed.
    ///
    /// The accepted socket inherits this listener's buffer size settings.
    pub fn accept(
        &self,
        pool: &ThreadPool,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> io::Result<Socket> {
        let descriptor = self.fast_accept()?;
        Socket::from_descriptor(descriptor, pool, &self.shared.event_loop, handler)
    }

    /// Like accept, but only returns the descriptor.
    ///
    /// Best suited for tight accept loops where the descriptor is handed
    /// off to other threads.
    pub fn fast_accept(&self) -> io::Result<SocketDescriptor> {
        let shared = &self.shared;
        let fd = {
            let mut st = shared.state.lock().unwrap();
            if st.fd == INVALID_SOCKET {
                return Err(io::Error::from_raw_os_error(errc::ENOTSOCK));
            }
            // Re-arm the edge trigger for further connection events.
            st.waiting |= WAIT_ACCEPT;
            shared.wake(&mut st);

            let accepted = sys::tcp::accept(st.fd)?;
            if let Err(err) = sys::tcp::set_buffer_sizes(
                accepted,
                st.buffer_sizes[0],
                st.buffer_sizes[1],
            ) {
                sys::tcp::close(accepted);
                return Err(err);
            }
            accepted
        };
        Ok(SocketDescriptor::new(fd))
    }

    /// Current state.
    pub fn state(&self) -> ListenSocketState {
        self.shared.state.lock().unwrap().listen_state
    }

    /// Binds to a specific local IP. Must be called before
    /// [`ListenSocket::listen`].
    pub fn bind(&self, address: IpAddr) {
        self.shared.state.lock().unwrap().bind_addr = Some(address);
    }

    /// Local port the socket listens on.
    pub fn local_port(&self) -> io::Result<u16> {
        let st = self.shared.state.lock().unwrap();
        if st.fd == INVALID_SOCKET {
            return Err(io::Error::from_raw_os_error(errc::ENOTSOCK));
        }
        sys::tcp::local_addr(st.fd).map(|addr| addr.port())
    }

    /// Buffer sizes inherited by accepted sockets.
    pub fn set_buffer_sizes(&self, receive: Option<usize>, send: Option<usize>) -> io::Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        st.buffer_sizes = [receive, send];
        Ok(())
    }

    /// Changes the associated event handler; pending connection events are
    /// re-addressed or dropped.
    pub fn set_event_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();
        let old = st.handler.take();
        if let Some(old_handler) = &old {
            change_socket_event_handler(
                &shared.event_loop,
                old_handler,
                handler.as_ref(),
                shared.source,
                SocketEventFlags::EMPTY,
            );
        }
        st.handler = handler;
    }

    /// The id this socket stamps on its events.
    pub fn source_id(&self) -> SourceId {
        self.shared.source
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        let handler = {
            let mut st = self.shared.state.lock().unwrap();
            if st.fd != INVALID_SOCKET {
                if st.task.is_some() {
                    let fd = st.fd;
                    st.fds_to_close.push(fd);
                } else {
                    sys::tcp::close(st.fd);
                }
                st.fd = INVALID_SOCKET;
            }
            st.listen_state = ListenSocketState::None;
            st.waiting = 0;
            st.triggered = 0;
            st.quit = true;
            let handler = st.handler.take();
            self.shared.wake(&mut st);
            if let Some(mut task) = st.task.take() {
                task.detach();
            }
            handler
        };
        if let Some(handler) = handler {
            remove_socket_events(&self.shared.event_loop, &handler, self.shared.source);
        }
    }
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("ListenSocket")
            .field("state", &st.listen_state)
            .finish()
    }
}
