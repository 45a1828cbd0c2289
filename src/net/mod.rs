//! Non-blocking TCP sockets with edge-triggered socket events.
//!
//! [`Socket`] and [`ListenSocket`] own a background worker thread which
//! waits for readiness with the system poller and posts [`SocketEvent`]s to
//! the owning [`EventLoop`](crate::EventLoop). Events are edge-triggered,
//! see the [crate documentation](crate) for the contract.

use std::sync::atomic::{AtomicUsize, Ordering};

/// POSIX error numbers used by the core, with numeric fallbacks on targets
/// without libc.
pub(crate) mod errc {
    #[cfg(unix)]
    pub(crate) use libc::{
        EAGAIN, EALREADY, ECONNABORTED, EHOSTUNREACH, EINVAL, EISCONN, ENOTCONN, ENOTSOCK,
    };

    #[cfg(not(unix))]
    mod fallback {
        pub(crate) const EAGAIN: i32 = 11;
        pub(crate) const EALREADY: i32 = 114;
        pub(crate) const ECONNABORTED: i32 = 103;
        pub(crate) const EHOSTUNREACH: i32 = 113;
        pub(crate) const EINVAL: i32 = 22;
        pub(crate) const EISCONN: i32 = 106;
        pub(crate) const ENOTCONN: i32 = 107;
        pub(crate) const ENOTSOCK: i32 = 88;
    }
    #[cfg(not(unix))]
    pub(crate) use self::fallback::*;
}

mod descriptor;
mod event;
mod listener;
mod socket;
mod thread;

pub use self::descriptor::SocketDescriptor;
pub use self::event::{
    as_host_address_event, as_socket_event, change_socket_event_handler, has_pending_event,
    remove_socket_events, HostAddressEvent, HostAddressTag, SocketEvent, SocketEventFlag,
    SocketEventFlags, SocketEventTag,
};
pub(crate) use self::event::socket_event;
pub use self::listener::{ListenSocket, ListenSocketState};
pub use self::socket::Socket;

/// Address family for connecting and listening.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AddressFamily {
    /// Either IPv4 or IPv6.
    #[default]
    Unknown,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

/// State of a [`Socket`]. Transitions are monotonically increasing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord)]
pub enum SocketState {
    /// How the socket starts out.
    #[default]
    None,
    /// Only in connecting state you can get a connection event. After the
    /// event the socket is connected or failed, depending on the event's
    /// error value.
    Connecting,
    /// Normal working state, read and write events can be received.
    Connected,
    /// The write side is being shut down; transitions to `ShutDown` with a
    /// single write event.
    ShuttingDown,
    /// Write side has finished shutting down. Receiving still works.
    ShutDown,
    /// Socket has been closed. Further events disabled.
    Closed,
    /// Socket has failed. Further events disabled.
    Failed,
}

/// Identifies the emitter of socket events in a layered stack.
///
/// Every socket and every layer stacked on one has its own id; events carry
/// the id of the layer that emitted them, and each layer also exposes the
/// [`root`](crate::layer::SocketInterface::root_id) of its stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SourceId(usize);

static NEXT_SOURCE_ID: AtomicUsize = AtomicUsize::new(1);

impl SourceId {
    /// Allocates a fresh id, distinct from every id handed out before.
    pub fn next() -> SourceId {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Gets a symbolic name for a socket error, e.g.
/// `error_string(libc::EAGAIN) == "EAGAIN"`, or the number as string if the
/// error is not known.
pub fn error_string(error: i32) -> String {
    #[cfg(unix)]
    {
        let name = match error {
            libc::EACCES => "EACCES",
            libc::EADDRINUSE => "EADDRINUSE",
            libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
            libc::EAFNOSUPPORT => "EAFNOSUPPORT",
            libc::EAGAIN => "EAGAIN",
            libc::EALREADY => "EALREADY",
            libc::EBADF => "EBADF",
            libc::ECONNABORTED => "ECONNABORTED",
            libc::ECONNREFUSED => "ECONNREFUSED",
            libc::ECONNRESET => "ECONNRESET",
            libc::EHOSTDOWN => "EHOSTDOWN",
            libc::EHOSTUNREACH => "EHOSTUNREACH",
            libc::EINPROGRESS => "EINPROGRESS",
            libc::EINTR => "EINTR",
            libc::EINVAL => "EINVAL",
            libc::EISCONN => "EISCONN",
            libc::EMFILE => "EMFILE",
            libc::EMSGSIZE => "EMSGSIZE",
            libc::ENETDOWN => "ENETDOWN",
            libc::ENETRESET => "ENETRESET",
            libc::ENETUNREACH => "ENETUNREACH",
            libc::ENOBUFS => "ENOBUFS",
            libc::ENOTCONN => "ENOTCONN",
            libc::ENOTSOCK => "ENOTSOCK",
            libc::EPIPE => "EPIPE",
            libc::ESHUTDOWN => "ESHUTDOWN",
            libc::ETIMEDOUT => "ETIMEDOUT",
            _ => return error.to_string(),
        };
        name.to_owned()
    }
    #[cfg(not(unix))]
    {
        error.to_string()
    }
}
