//! The per-socket worker thread.
//!
//! Every socket owns a worker which translates poll results into socket
//! events. The worker holds the socket mutex except while blocked in the
//! poller; user threads interrupt the poller to change the wait mask.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::trace;

use crate::event::{EventHandler, EventLoop};
use crate::net::errc;
use crate::net::event::socket_event;
use crate::net::{
    AddressFamily, HostAddressEvent, ListenSocketState, SocketEventFlag, SocketState, SourceId,
};
use crate::pool::{AsyncTask, ThreadPool};
use crate::sys::{self, Poller, INVALID_SOCKET};

pub(crate) const WAIT_CONNECT: u8 = 0x01;
pub(crate) const WAIT_READ: u8 = 0x02;
pub(crate) const WAIT_WRITE: u8 = 0x04;
pub(crate) const WAIT_ACCEPT: u8 = 0x08;

/// `Socket::FLAG_NODELAY` / `Socket::FLAG_KEEPALIVE` values live here so the
/// worker can apply them.
pub(crate) const FLAG_NODELAY: u8 = 0x01;
pub(crate) const FLAG_KEEPALIVE: u8 = 0x02;

pub(crate) struct ThreadState {
    pub(crate) fd: sys::RawSocket,
    pub(crate) state: SocketState,
    pub(crate) listen_state: ListenSocketState,
    pub(crate) handler: Option<Arc<dyn EventHandler>>,

    // Pending connect request.
    pub(crate) connect_pending: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) family: AddressFamily,

    /// The hostname passed to connect, or the peer address of an accepted
    /// socket.
    pub(crate) peer_host: String,
    pub(crate) bind_addr: Option<IpAddr>,

    pub(crate) flags: u8,
    pub(crate) keepalive_interval: Duration,
    pub(crate) buffer_sizes: [Option<usize>; 2],

    // Edge-trigger bookkeeping: the socket events we are waiting for and
    // the ones that have triggered but were not yet sent.
    pub(crate) waiting: u8,
    pub(crate) triggered: u8,
    pub(crate) triggered_errors: [i32; 4],

    // Poller handshake.
    pub(crate) signalled: bool,
    pub(crate) idle_wait: bool,

    pub(crate) quit: bool,
    pub(crate) fds_to_close: Vec<sys::RawSocket>,
    pub(crate) task: Option<AsyncTask>,
}

pub(crate) struct SocketShared {
    pub(crate) state: Mutex<ThreadState>,
    pub(crate) cond: Condvar,
    pub(crate) poller: Poller,
    pub(crate) source: SourceId,
    pub(crate) event_loop: EventLoop,
    pub(crate) pool: ThreadPool,
}

type Guard<'a> = MutexGuard<'a, ThreadState>;

impl SocketShared {
    pub(crate) fn new(
        pool: &ThreadPool,
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> io::Result<Arc<SocketShared>> {
        Ok(Arc::new(SocketShared {
            state: Mutex::new(ThreadState {
                fd: INVALID_SOCKET,
                state: SocketState::None,
                listen_state: ListenSocketState::None,
                handler,
                connect_pending: false,
                host: String::new(),
                port: 0,
                family: AddressFamily::Unknown,
                peer_host: String::new(),
                bind_addr: None,
                flags: 0,
                keepalive_interval: Duration::from_secs(2 * 60 * 60),
                buffer_sizes: [None, None],
                waiting: 0,
                triggered: 0,
                triggered_errors: [0; 4],
                signalled: false,
                idle_wait: false,
                quit: false,
                fds_to_close: Vec::new(),
                task: None,
            }),
            cond: Condvar::new(),
            poller: Poller::new()?,
            source: SourceId::next(),
            event_loop: event_loop.clone(),
            pool: pool.clone(),
        }))
    }

    /// Interrupts the worker's poll or idle wait. Call with the state lock
    /// held.
    pub(crate) fn wake(&self, st: &mut ThreadState) {
        st.signalled = true;
        if st.idle_wait {
            self.cond.notify_one();
        } else {
            self.poller.interrupt();
        }
    }

    /// Spawns the worker if it is not running yet.
    pub(crate) fn start(self: &Arc<Self>, st: &mut ThreadState) {
        if st.task.is_some() {
            self.wake(st);
            return;
        }
        let shared = Arc::clone(self);
        st.task = Some(self.pool.spawn(move || entry(shared)));
    }

    /// Posts a socket event to the current handler, if any.
    pub(crate) fn send_event(&self, st: &ThreadState, flag: SocketEventFlag, error: i32) {
        if let Some(handler) = &st.handler {
            self.event_loop
                .send(handler, socket_event(self.source, flag, error));
        }
    }
}

pub(crate) fn apply_options(st: &ThreadState, fd: sys::RawSocket) {
    let _ = sys::tcp::set_nodelay(fd, st.flags & FLAG_NODELAY != 0);
    let _ = sys::tcp::set_keepalive(fd, st.flags & FLAG_KEEPALIVE != 0, st.keepalive_interval);
    let _ = sys::tcp::set_buffer_sizes(fd, st.buffer_sizes[0], st.buffer_sizes[1]);
}

fn close_pending(st: &mut ThreadState) {
    for fd in st.fds_to_close.drain(..) {
        sys::tcp::close(fd);
    }
}

/// Worker main loop.
fn entry(shared: Arc<SocketShared>) {
    let mut st = shared.state.lock().unwrap();
    loop {
        close_pending(&mut st);
        if st.quit {
            break;
        }

        if st.connect_pending {
            st = do_connect(&shared, st);
            continue;
        }

        if st.fd == INVALID_SOCKET || st.waiting == 0 {
            if !st.signalled {
                st.idle_wait = true;
                st = shared.cond.wait(st).unwrap();
                st.idle_wait = false;
            }
            st.signalled = false;
            continue;
        }

        let (guard, ok) = do_wait(&shared, st, 0);
        st = guard;
        if ok {
            send_events(&shared, &mut st);
        }
    }

    close_pending(&mut st);
    if st.fd != INVALID_SOCKET {
        sys::tcp::close(st.fd);
        st.fd = INVALID_SOCKET;
    }
}

/// Waits until any event in the wait mask (extended by `extra`) triggers.
///
/// Returns `false` if the wait was abandoned because the socket was closed
/// or the worker is quitting.
fn do_wait<'a>(shared: &'a SocketShared, mut st: Guard<'a>, extra: u8) -> (Guard<'a>, bool) {
    st.waiting |= extra;

    loop {
        if st.quit || st.fd == INVALID_SOCKET {
            return (st, false);
        }

        let fd = st.fd;
        let read = st.waiting & (WAIT_READ | WAIT_ACCEPT) != 0;
        let write = st.waiting & (WAIT_WRITE | WAIT_CONNECT) != 0;
        drop(st);

        let res = shared.poller.wait(fd, read, write);

        let mut guard = shared.state.lock().unwrap();
        guard.signalled = false;

        let ready = match res {
            Ok(ready) => ready,
            Err(err) => {
                trace!("poller wait failed: {}", err);
                return (guard, false);
            }
        };
        if guard.quit || guard.fd == INVALID_SOCKET {
            return (guard, false);
        }

        if guard.waiting & WAIT_CONNECT != 0 {
            if ready.writable {
                let error = match sys::tcp::take_error(guard.fd) {
                    Ok(error) => error,
                    Err(err) => err.raw_os_error().unwrap_or(0),
                };
                guard.triggered |= WAIT_CONNECT;
                guard.triggered_errors[0] = error;
                guard.waiting &= !WAIT_CONNECT;
            }
        } else if guard.waiting & WAIT_ACCEPT != 0 {
            if ready.readable {
                guard.triggered |= WAIT_ACCEPT;
                guard.waiting &= !WAIT_ACCEPT;
            }
        } else {
            if guard.waiting & WAIT_READ != 0 && ready.readable {
                guard.triggered |= WAIT_READ;
                guard.waiting &= !WAIT_READ;
            }
            if guard.waiting & WAIT_WRITE != 0 && ready.writable {
                guard.triggered |= WAIT_WRITE;
                guard.waiting &= !WAIT_WRITE;
            }
        }

        if guard.triggered != 0 || guard.waiting == 0 {
            return (guard, true);
        }
        st = guard;
    }
}

/// Sends the triggered events. Events stay triggered while there is no
/// handler; `set_event_handler` synthesizes them for the new handler.
fn send_events(shared: &SocketShared, st: &mut ThreadState) {
    if st.handler.is_none() {
        return;
    }

    if st.triggered & WAIT_READ != 0 {
        shared.send_event(st, SocketEventFlag::Read, st.triggered_errors[1]);
        st.triggered &= !WAIT_READ;
    }
    if st.triggered & WAIT_WRITE != 0 {
        shared.send_event(st, SocketEventFlag::Write, st.triggered_errors[2]);
        st.triggered &= !WAIT_WRITE;
    }
    if st.triggered & WAIT_ACCEPT != 0 {
        shared.send_event(st, SocketEventFlag::Connection, st.triggered_errors[3]);
        st.triggered &= !WAIT_ACCEPT;
    }
}

enum Attempt {
    Connected,
    NextCandidate,
    Aborted,
}

fn do_connect<'a>(shared: &'a SocketShared, mut st: Guard<'a>) -> Guard<'a> {
    st.connect_pending = false;
    let host = std::mem::take(&mut st.host);
    let port = st.port;
    let family = st.family;

    if host.is_empty() {
        st.state = SocketState::Failed;
        return st;
    }

    // Resolution blocks; release the lock meanwhile.
    drop(st);
    let resolved: io::Result<Vec<SocketAddr>> =
        (host.as_str(), port).to_socket_addrs().map(|it| it.collect());
    let mut st = shared.state.lock().unwrap();

    if st.quit {
        return st;
    }
    // If the state is no longer connecting, close() was called. If a new
    // connect request is pending, close() and connect() were called; either
    // way this attempt is abandoned.
    if st.state != SocketState::Connecting || st.connect_pending {
        return st;
    }

    let addrs = match resolved {
        Ok(addrs) => addrs,
        Err(err) => {
            let code = err.raw_os_error().unwrap_or(errc::EHOSTUNREACH);
            shared.send_event(&st, SocketEventFlag::Connection, code);
            st.state = SocketState::Failed;
            return st;
        }
    };

    let addrs: Vec<SocketAddr> = addrs
        .into_iter()
        .filter(|addr| match family {
            AddressFamily::Unknown => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        })
        .collect();

    if addrs.is_empty() {
        shared.send_event(&st, SocketEventFlag::Connection, errc::EHOSTUNREACH);
        st.state = SocketState::Failed;
        return st;
    }

    let count = addrs.len();
    for (i, addr) in addrs.into_iter().enumerate() {
        let last = i + 1 == count;
        let (guard, outcome) = try_connect_host(shared, st, addr, last);
        st = guard;
        match outcome {
            Attempt::Connected | Attempt::Aborted => return st,
            Attempt::NextCandidate => {}
        }
    }
    st
}

fn try_connect_host<'a>(
    shared: &'a SocketShared,
    mut st: Guard<'a>,
    addr: SocketAddr,
    last: bool,
) -> (Guard<'a>, Attempt) {
    if let Some(handler) = &st.handler {
        shared.event_loop.send(
            handler,
            Box::new(HostAddressEvent::new((shared.source, addr.ip().to_string()))),
        );
    }

    let next_flag = if last {
        SocketEventFlag::Connection
    } else {
        SocketEventFlag::ConnectionNext
    };

    let fd = match sys::tcp::new_socket(&addr) {
        Ok(fd) => fd,
        Err(err) => {
            shared.send_event(&st, next_flag, err.raw_os_error().unwrap_or(0));
            return fail_attempt(st, last);
        }
    };

    if let Some(bind_ip) = st.bind_addr {
        if bind_ip.is_ipv4() == addr.is_ipv4() {
            let _ = sys::tcp::bind(fd, &SocketAddr::new(bind_ip, 0));
        }
    }
    apply_options(&st, fd);
    st.fd = fd;

    let error = match sys::tcp::connect(fd, &addr) {
        Ok(true) => 0,
        Ok(false) => {
            // Connection in progress; wait for the outcome.
            loop {
                let (guard, ok) = do_wait(shared, st, WAIT_CONNECT);
                st = guard;
                if st.triggered & WAIT_CONNECT != 0 {
                    break;
                }
                if !ok {
                    if st.fd != INVALID_SOCKET {
                        sys::tcp::close(st.fd);
                        st.fd = INVALID_SOCKET;
                    }
                    return (st, Attempt::Aborted);
                }
            }
            st.triggered &= !WAIT_CONNECT;
            st.triggered_errors[0]
        }
        Err(err) => err.raw_os_error().unwrap_or(0),
    };
    if error == 0 && st.fd == INVALID_SOCKET {
        // Closed while connecting.
        return (st, Attempt::Aborted);
    }
    if error == 0 {
        st.state = SocketState::Connected;
        shared.send_event(&st, SocketEventFlag::Connection, 0);
        // We are now interested in all the other nice events.
        st.waiting |= WAIT_READ;
        trace!("connected to {}", addr);
        return (st, Attempt::Connected);
    }

    if st.fd != INVALID_SOCKET {
        sys::tcp::close(st.fd);
        st.fd = INVALID_SOCKET;
    }
    shared.send_event(&st, next_flag, error);
    fail_attempt(st, last)
}

fn fail_attempt(mut st: Guard<'_>, last: bool) -> (Guard<'_>, Attempt) {
    if last {
        st.state = SocketState::Failed;
        (st, Attempt::Aborted)
    } else {
        (st, Attempt::NextCandidate)
    }
}
