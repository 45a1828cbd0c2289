//! Stackable socket layers.
//!
//! A layer implements [`SocketInterface`] on top of a next-lower interface,
//! either passing events through verbatim or consuming lower events and
//! emitting its own with the same edge-triggered contract. Layers can in
//! general be stacked on the next layer in any state, though individual
//! layers may pose restrictions.
//!
//! For safe closing of a layer hierarchy, both the write and the read side
//! should be shut down first, otherwise pending data might get discarded.
//! The `shutdown` and `shutdown_read` functions may return
//! [`WouldBlock`](std::io::ErrorKind::WouldBlock), in which case they must
//! be called again after the next write/read event.

use std::io;
use std::sync::{Arc, Mutex};

use crate::event::{EventHandler, EventLoop};
use crate::net::{
    socket_event, AddressFamily, HostAddressEvent, SocketEventFlag, SocketEventFlags, SocketState,
    SourceId,
};

/// Interface shared by sockets and all layers stacked on them.
///
/// See [`Socket`](crate::net::Socket) for the expected semantics of the
/// individual operations.
pub trait SocketInterface: Send + Sync {
    /// Starts connecting through this layer.
    fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()>;

    /// Reads data; 0 means EOF, `WouldBlock` means wait for the next read
    /// event.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes data; `WouldBlock` means wait for the next write event.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Signals the peer that we want to close the connection. Only
    /// disallows further sends, reading is unaffected.
    ///
    /// On `WouldBlock` the shutdown is not complete yet; call again after
    /// the next write event.
    fn shutdown(&self) -> io::Result<()>;

    /// Checks that all layers further down have also reached EOF.
    ///
    /// Can only be called after `read` has returned 0. Some layers may
    /// reach EOF before the next lower layer has, such as the secure
    /// channel EOF of the TLS layer; this drives the stack down until the
    /// bottom EOF has been observed. On `WouldBlock`, wait for a read event
    /// and call again.
    ///
    /// Closing the stack without all layers having reached EOF can truncate
    /// pending send data on the peer side.
    fn shutdown_read(&self) -> io::Result<()>;

    /// Current state, mirroring the state of the bottom socket unless the
    /// layer keeps its own state machine.
    fn state(&self) -> SocketState;

    /// Changes the handler receiving the events generated (or forwarded) by
    /// this layer.
    fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        retrigger_block: SocketEventFlags,
    );

    /// The peer host. A proxy layer would return the host connected to
    /// through the proxy rather than the proxy itself.
    fn peer_host(&self) -> String;

    /// The peer port, subject to the same overriding as
    /// [`SocketInterface::peer_host`].
    fn peer_port(&self) -> io::Result<u16>;

    /// The id this layer stamps on the events it emits.
    fn source_id(&self) -> SourceId;

    /// The id of the ultimate event source at the bottom of the stack.
    fn root_id(&self) -> SourceId;
}

/// Common state of a socket layer: the next-lower interface, the event
/// handler served by this layer and the source identities.
///
/// Layers embed this and either enable pass-through (lower events reach the
/// handler unmodified) or install themselves as the lower layer's handler
/// and forward or translate events explicitly.
pub struct LayerBase {
    event_loop: EventLoop,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    next: Arc<dyn SocketInterface>,
    source: SourceId,
}

impl LayerBase {
    /// Creates the base of a layer on top of `next`.
    pub fn new(
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
        next: Arc<dyn SocketInterface>,
    ) -> LayerBase {
        LayerBase {
            event_loop: event_loop.clone(),
            handler: Mutex::new(handler),
            next,
            source: SourceId::next(),
        }
    }

    /// The loop this layer posts events to.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// The next layer further down. Usually another layer or the actual
    /// socket.
    pub fn next(&self) -> &Arc<dyn SocketInterface> {
        &self.next
    }

    /// The handler currently served by this layer.
    pub fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.lock().unwrap().clone()
    }

    /// Replaces the served handler, returning the old one.
    pub fn replace_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Option<Arc<dyn EventHandler>> {
        std::mem::replace(&mut *self.handler.lock().unwrap(), handler)
    }

    /// The id this layer stamps on the events it emits.
    pub fn source_id(&self) -> SourceId {
        self.source
    }

    /// The id of the bottom of the stack.
    pub fn root_id(&self) -> SourceId {
        self.next.root_id()
    }

    /// Enables pass-through: the next layer sends its events directly to
    /// `handler`, re-stamped with the lower source id as usual.
    pub fn set_event_passthrough(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.handler.lock().unwrap() = handler.clone();
        self.next.set_event_handler(handler, SocketEventFlags::EMPTY);
    }

    /// Handler change for a pass-through layer: pending events from this
    /// layer are re-addressed (or dropped per `retrigger_block`), then the
    /// change propagates to the next layer.
    pub fn set_event_handler_passthrough(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        retrigger_block: SocketEventFlags,
    ) {
        let old = self.replace_handler(handler.clone());
        if let Some(old) = &old {
            crate::net::change_socket_event_handler(
                &self.event_loop,
                old,
                handler.as_ref(),
                self.source,
                retrigger_block,
            );
        }
        self.next.set_event_handler(handler, retrigger_block);
    }

    /// Emits a socket event from this layer to the served handler.
    ///
    /// Call from an intercepting layer's event handler to surface an event
    /// under this layer's own source id.
    pub fn forward_socket_event(&self, flag: SocketEventFlag, error: i32) {
        if let Some(handler) = self.handler() {
            self.event_loop
                .send(&handler, socket_event(self.source, flag, error));
        }
    }

    /// Re-emits a host address event under this layer's source id.
    pub fn forward_host_address_event(&self, address: String) {
        if let Some(handler) = self.handler() {
            self.event_loop.send(
                &handler,
                Box::new(HostAddressEvent::new((self.source, address))),
            );
        }
    }
}

impl std::fmt::Debug for LayerBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerBase")
            .field("source", &self.source)
            .finish()
    }
}
