//! Socket events and helpers to filter or re-address them on a loop.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::event::{Event, EventHandler, EventLoop, EventTag, TypedEvent};
use crate::net::SourceId;

/// The type of a socket event.
///
/// In received events exactly one flag is set; combinations occur in the
/// [`SocketEventFlags`] masks used when changing event handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SocketEventFlag {
    /// A connection attempt has failed, but there are more addresses to
    /// try. The error is advisory and not fatal.
    ConnectionNext,
    /// Without error: the connection has been established (on sockets), or
    /// an incoming connection is pending (on listen sockets). With error:
    /// connecting failed.
    Connection,
    /// Without error: data has become available. With error: the connection
    /// has failed.
    Read,
    /// Without error: data can be written. With error: the connection has
    /// failed.
    Write,
}

impl SocketEventFlag {
    fn bit(self) -> u8 {
        match self {
            SocketEventFlag::ConnectionNext => 0x1,
            SocketEventFlag::Connection => 0x2,
            SocketEventFlag::Read => 0x4,
            SocketEventFlag::Write => 0x8,
        }
    }
}

/// A set of [`SocketEventFlag`]s.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SocketEventFlags(u8);

impl SocketEventFlags {
    /// The empty set.
    pub const EMPTY: SocketEventFlags = SocketEventFlags(0);

    /// Whether `flag` is in the set.
    pub fn contains(self, flag: SocketEventFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<SocketEventFlag> for SocketEventFlags {
    fn from(flag: SocketEventFlag) -> SocketEventFlags {
        SocketEventFlags(flag.bit())
    }
}

impl BitOr for SocketEventFlags {
    type Output = SocketEventFlags;

    fn bitor(self, rhs: SocketEventFlags) -> SocketEventFlags {
        SocketEventFlags(self.0 | rhs.0)
    }
}

impl BitOr<SocketEventFlag> for SocketEventFlags {
    type Output = SocketEventFlags;

    fn bitor(self, rhs: SocketEventFlag) -> SocketEventFlags {
        SocketEventFlags(self.0 | rhs.bit())
    }
}

impl BitOr for SocketEventFlag {
    type Output = SocketEventFlags;

    fn bitor(self, rhs: SocketEventFlag) -> SocketEventFlags {
        SocketEventFlags(self.bit() | rhs.bit())
    }
}

impl BitOrAssign<SocketEventFlag> for SocketEventFlags {
    fn bitor_assign(&mut self, rhs: SocketEventFlag) {
        self.0 |= rhs.bit();
    }
}

/// Tag of [`SocketEvent`].
#[derive(Debug)]
pub enum SocketEventTag {}

impl EventTag for SocketEventTag {
    type Value = (SourceId, SocketEventFlag, i32);
}

/// All socket events are sent through this.
///
/// The value is `(source, flag, error)`. A non-zero error on connection,
/// read or write events means the socket has failed and needs to be closed;
/// doing anything else with failed sockets is undefined behavior. Failure
/// events can be received at any time.
///
/// Read and write events are edge-triggered:
///
/// * After receiving a read event for a source, it is not sent again until
///   a subsequent `read` or `shutdown_read` call has returned
///   [`WouldBlock`](std::io::ErrorKind::WouldBlock).
/// * The same holds for the write event with `write` and `shutdown`.
/// * A successful connection event doubles as write event; it does not act
///   as read event.
///
/// It is a grave violation to call read/write/shutdown again after they
/// returned `WouldBlock` without first waiting for the event.
pub type SocketEvent = TypedEvent<SocketEventTag>;

/// Tag of [`HostAddressEvent`].
#[derive(Debug)]
pub enum HostAddressTag {}

impl EventTag for HostAddressTag {
    type Value = (SourceId, String);
}

/// Sent with the resolved address literal whenever a hostname has been
/// resolved during connection establishment.
pub type HostAddressEvent = TypedEvent<HostAddressTag>;

/// Views `ev` as a socket event.
pub fn as_socket_event(ev: &dyn Event) -> Option<&(SourceId, SocketEventFlag, i32)> {
    ev.as_any()
        .downcast_ref::<SocketEvent>()
        .map(|ev| &ev.value)
}

/// Views `ev` as a host address event.
pub fn as_host_address_event(ev: &dyn Event) -> Option<&(SourceId, String)> {
    ev.as_any()
        .downcast_ref::<HostAddressEvent>()
        .map(|ev| &ev.value)
}

/// Removes all pending socket and host address events from `source` sent to
/// `handler`.
///
/// Useful e.g. when destroying the handler while keeping the source.
pub fn remove_socket_events(
    event_loop: &EventLoop,
    handler: &Arc<dyn EventHandler>,
    source: SourceId,
) {
    event_loop.filter_events(|entry| {
        if !entry.is_for(handler) {
            return false;
        }
        let matches_source = as_socket_event(&*entry.event).map(|v| v.0) == Some(source)
            || as_host_address_event(&*entry.event).map(|v| v.0) == Some(source);
        matches_source
    });
}

/// Re-addresses all pending socket events from `source` to `new_handler`,
/// removing events whose flag is in `remove`. With no new handler all
/// matching events are removed.
///
/// Used by `set_event_handler` implementations, e.g. for handler handoff
/// after a proxy handshake or to TLS classes in a STARTTLS mechanism.
///
/// Returns the flags of the events still pending afterwards.
pub fn change_socket_event_handler(
    event_loop: &EventLoop,
    old_handler: &Arc<dyn EventHandler>,
    new_handler: Option<&Arc<dyn EventHandler>>,
    source: SourceId,
    remove: SocketEventFlags,
) -> SocketEventFlags {
    let mut pending = SocketEventFlags::EMPTY;
    event_loop.filter_events(|entry| {
        if !entry.is_for(old_handler) {
            return false;
        }
        match as_socket_event(&*entry.event) {
            Some(&(ev_source, flag, _)) if ev_source == source => {
                if remove.contains(flag) {
                    return true;
                }
                match new_handler {
                    Some(handler) => {
                        entry.handler = Arc::clone(handler);
                        pending |= flag;
                        false
                    }
                    None => true,
                }
            }
            _ => {
                // Host address events follow the socket events.
                if as_host_address_event(&*entry.event).map(|v| v.0) == Some(source) {
                    match new_handler {
                        Some(handler) => {
                            entry.handler = Arc::clone(handler);
                            false
                        }
                        None => true,
                    }
                } else {
                    false
                }
            }
        }
    });
    pending
}

/// Whether an event from `source` with a flag in `flags` is queued for
/// `handler`. Primarily useful to assert the edge-trigger bookkeeping in
/// tests.
pub fn has_pending_event(
    event_loop: &EventLoop,
    handler: &Arc<dyn EventHandler>,
    source: SourceId,
    flags: SocketEventFlags,
) -> bool {
    let mut found = false;
    event_loop.filter_events(|entry| {
        if entry.is_for(handler) {
            if let Some(&(ev_source, flag, _)) = as_socket_event(&*entry.event) {
                if ev_source == source && flags.contains(flag) {
                    found = true;
                }
            }
        }
        false
    });
    found
}

/// Builds a socket event ready for sending.
pub(crate) fn socket_event(source: SourceId, flag: SocketEventFlag, error: i32) -> Box<dyn Event> {
    Box::new(SocketEvent::new((source, flag, error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_sets() {
        let flags = SocketEventFlag::Read | SocketEventFlag::Write;
        assert!(flags.contains(SocketEventFlag::Read));
        assert!(flags.contains(SocketEventFlag::Write));
        assert!(!flags.contains(SocketEventFlag::Connection));
        assert!(SocketEventFlags::EMPTY.is_empty());

        let mut flags = SocketEventFlags::from(SocketEventFlag::Connection);
        flags |= SocketEventFlag::ConnectionNext;
        assert!(flags.contains(SocketEventFlag::ConnectionNext));
    }
}
