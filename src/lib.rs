//! Event-driven non-blocking networking with composable protocol layers.
//!
//! evnet provides the building blocks for writing non-trivial networking
//! applications:
//!
//! * A typed [event system](crate::event) and a single-threaded cooperative
//!   [`EventLoop`] with timers.
//! * An edge-triggered, non-blocking TCP [socket core](crate::net). Each
//!   socket owns a background worker that waits for readiness and posts
//!   [`SocketEvent`]s to the owning event loop.
//! * A [socket layer](crate::layer) abstraction for stacking protocol layers
//!   on top of sockets, with a [TLS layer](crate::tls) and
//!   [rate-limited layers](crate::rate) built on it.
//! * A hierarchical token-bucket [rate limiter](crate::rate).
//! * Asynchronous [hostname lookup](crate::lookup).
//!
//! # The edge-triggered contract
//!
//! Read and write events are edge-triggered: after receiving a `Read` event
//! for a source, another one is only sent once a `read` call on it has
//! returned [`WouldBlock`]. The same holds for `Write` events, with the
//! successful `Connection` event doubling as the initial write event.
//! Operations must be repeated until they return [`WouldBlock`], otherwise
//! no further event is delivered for that direction.
//!
//! [`WouldBlock`]: std::io::ErrorKind::WouldBlock

#![warn(missing_debug_implementations, rust_2018_idioms)]
// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

#[macro_use]
mod macros;

pub mod buffer;
pub mod event;
pub mod layer;
pub mod lookup;
pub mod net;
pub mod pool;
pub mod rate;
mod sys;
pub mod tls;

pub use crate::buffer::Buffer;
pub use crate::event::{
    same_type, Event, EventHandler, EventLoop, EventTag, TimerEvent, TimerId, TypedEvent,
};
pub use crate::layer::SocketInterface;
pub use crate::net::{
    AddressFamily, HostAddressEvent, ListenSocket, Socket, SocketDescriptor, SocketEvent,
    SocketEventFlag, SocketEventFlags, SocketState, SourceId,
};
pub use crate::pool::{AsyncTask, ThreadPool};
