//! Asynchronous hostname lookup.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use crate::event::{EventHandler, EventLoop, EventTag, TypedEvent};
use crate::net::{errc, AddressFamily, SourceId};
use crate::pool::{AsyncTask, ThreadPool};

/// Tag of [`HostnameLookupEvent`].
#[derive(Debug)]
pub enum HostnameLookupTag {}

impl EventTag for HostnameLookupTag {
    type Value = (SourceId, i32, Vec<IpAddr>);
}

/// Sent once a lookup finishes, with `(source, error, addresses)`. On
/// success the error is 0 and at least one address is present.
pub type HostnameLookupEvent = TypedEvent<HostnameLookupTag>;

struct LookupState {
    handler: Option<Arc<dyn EventHandler>>,
    // Incremented by reset(); results of detached requests are dropped.
    generation: u64,
    in_flight: bool,
    task: Option<AsyncTask>,
}

struct Shared {
    event_loop: EventLoop,
    pool: ThreadPool,
    source: SourceId,
    state: Mutex<LookupState>,
}

/// Performs asynchronous hostname lookups on a background worker.
///
/// Results are posted as [`HostnameLookupEvent`]s to the handler. Only one
/// lookup can be in flight; [`HostnameLookup::reset`] detaches an in-flight
/// request so a new one can be started immediately.
pub struct HostnameLookup {
    shared: Arc<Shared>,
}

impl HostnameLookup {
    /// Creates a lookup posting its results to `handler` on `event_loop`.
    pub fn new(
        pool: &ThreadPool,
        event_loop: &EventLoop,
        handler: Arc<dyn EventHandler>,
    ) -> HostnameLookup {
        HostnameLookup {
            shared: Arc::new(Shared {
                event_loop: event_loop.clone(),
                pool: pool.clone(),
                source: SourceId::next(),
                state: Mutex::new(LookupState {
                    handler: Some(handler),
                    generation: 0,
                    in_flight: false,
                    task: None,
                }),
            }),
        }
    }

    /// Starts resolving `host`, restricted to `family` unless unknown.
    ///
    /// Fails with `EALREADY` if a lookup is already in flight and with
    /// `EINVAL` on an empty host.
    pub fn lookup(&self, host: &str, family: AddressFamily) -> io::Result<()> {
        if host.is_empty() {
            return Err(io::Error::from_raw_os_error(errc::EINVAL));
        }

        let shared = Arc::clone(&self.shared);
        let mut state = self.shared.state.lock().unwrap();
        if state.in_flight {
            return Err(io::Error::from_raw_os_error(errc::EALREADY));
        }
        state.in_flight = true;
        let generation = state.generation;
        let host = host.to_owned();

        let task = self.shared.pool.spawn(move || {
            let resolved: io::Result<Vec<IpAddr>> = (host.as_str(), 0u16)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|addr| addr.ip()).collect());

            let (error, mut addresses) = match resolved {
                Ok(addresses) => (0, addresses),
                Err(err) => (err.raw_os_error().unwrap_or(errc::EHOSTUNREACH), Vec::new()),
            };

            addresses.retain(|ip| match family {
                AddressFamily::Unknown => true,
                AddressFamily::Ipv4 => ip.is_ipv4(),
                AddressFamily::Ipv6 => ip.is_ipv6(),
            });
            addresses.dedup();
            let error = if error == 0 && addresses.is_empty() {
                errc::EHOSTUNREACH
            } else {
                error
            };

            let mut state = shared.state.lock().unwrap();
            if state.generation != generation {
                // Detached by reset() while resolving.
                return;
            }
            state.in_flight = false;
            if let Some(handler) = &state.handler {
                shared.event_loop.send(
                    handler,
                    Box::new(HostnameLookupEvent::new((shared.source, error, addresses))),
                );
            }
        });
        state.task = Some(task);
        Ok(())
    }

    /// Whether a lookup is currently in flight.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().in_flight
    }

    /// Detaches any in-flight request so a new lookup may be started
    /// immediately, and filters pending result events for this lookup from
    /// the handler's queue.
    pub fn reset(&self) {
        let handler = {
            let mut state = self.shared.state.lock().unwrap();
            state.generation += 1;
            state.in_flight = false;
            if let Some(mut task) = state.task.take() {
                task.detach();
            }
            state.handler.clone()
        };

        if let Some(handler) = handler {
            let source = self.shared.source;
            self.shared.event_loop.filter_events(|entry| {
                entry.is_for(&handler)
                    && entry
                        .event
                        .as_any()
                        .downcast_ref::<HostnameLookupEvent>()
                        .map(|ev| ev.value.0)
                        == Some(source)
            });
        }
    }

    /// The id lookup events of this instance carry.
    pub fn source_id(&self) -> SourceId {
        self.shared.source
    }
}

impl Drop for HostnameLookup {
    fn drop(&mut self) {
        self.reset();
        self.shared.state.lock().unwrap().handler = None;
    }
}

impl fmt::Debug for HostnameLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostnameLookup")
            .field("running", &self.is_running())
            .finish()
    }
}
