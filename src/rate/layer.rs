//! Rate-limited socket layers.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event::{EventHandler, EventLoop};
use crate::layer::{LayerBase, SocketInterface};
use crate::net::{errc, AddressFamily, SocketEventFlag, SocketEventFlags, SocketState, SourceId};
use crate::rate::limiter::LimiterShared;
use crate::rate::{Bucket, BucketObserver, Direction, RateLimiter, UNLIMITED};

fn would_block() -> io::Error {
    io::Error::from_raw_os_error(errc::EAGAIN)
}

/// A rate-limited socket layer.
///
/// A pass-through layer which is itself a token bucket attachable to a
/// [`RateLimiter`]. Reads and writes are capped by the available tokens;
/// when they run out the call returns
/// [`WouldBlock`](io::ErrorKind::WouldBlock) and a read/write event is
/// synthesized once the next tick refills the bucket.
pub struct RateLimitedLayer {
    base: LayerBase,
    bucket: Bucket,
}

impl RateLimitedLayer {
    /// Creates the layer on top of `next`, optionally attaching it to
    /// `limiter` right away.
    pub fn new(
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
        next: Arc<dyn SocketInterface>,
        limiter: Option<&RateLimiter>,
    ) -> Arc<RateLimitedLayer> {
        let layer = Arc::new(RateLimitedLayer {
            base: LayerBase::new(event_loop, None, next),
            bucket: Bucket::new(),
        });
        let observer: Weak<dyn BucketObserver> = Arc::downgrade(&layer) as Weak<dyn BucketObserver>;
        layer.bucket.set_observer(observer);
        layer.base.set_event_passthrough(handler);
        if let Some(limiter) = limiter {
            limiter.add_bucket(&layer.bucket);
        }
        layer
    }

    /// The layer's bucket, e.g. for attaching it to another limiter.
    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    fn limited_io<F>(&self, direction: Direction, len: usize, op: F) -> io::Result<usize>
    where
        F: FnOnce(usize) -> io::Result<usize>,
    {
        let max = self.bucket.available(direction);
        if max == 0 {
            return Err(would_block());
        }

        let capped = (len as u64).min(max) as usize;
        let transferred = op(capped)?;
        if transferred > 0 && max != UNLIMITED {
            self.bucket.consume(direction, transferred as u64);
        }
        Ok(transferred)
    }
}

impl BucketObserver for RateLimitedLayer {
    fn wakeup(&self, direction: Direction) {
        let flag = match direction {
            Direction::Inbound => SocketEventFlag::Read,
            Direction::Outbound => SocketEventFlag::Write,
        };
        self.base.forward_socket_event(flag, 0);
    }
}

impl SocketInterface for RateLimitedLayer {
    fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()> {
        self.base.next().connect(host, port, family)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.limited_io(Direction::Inbound, buf.len(), |capped| {
            self.base.next().read(&mut buf[..capped])
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.limited_io(Direction::Outbound, buf.len(), |capped| {
            self.base.next().write(&buf[..capped])
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        self.base.next().shutdown()
    }

    fn shutdown_read(&self) -> io::Result<()> {
        self.base.next().shutdown_read()
    }

    fn state(&self) -> SocketState {
        self.base.next().state()
    }

    fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        mut retrigger_block: SocketEventFlags,
    ) {
        // Directions waiting on tokens get their event from the bucket
        // wakeup; retriggering them here would double-fire.
        if self.bucket.is_waiting(Direction::Inbound) {
            retrigger_block |= SocketEventFlag::Read;
        }
        if self.bucket.is_waiting(Direction::Outbound) {
            retrigger_block |= SocketEventFlag::Write;
        }
        self.base
            .set_event_handler_passthrough(handler, retrigger_block);
    }

    fn peer_host(&self) -> String {
        self.base.next().peer_host()
    }

    fn peer_port(&self) -> io::Result<u16> {
        self.base.next().peer_port()
    }

    fn source_id(&self) -> SourceId {
        self.base.source_id()
    }

    fn root_id(&self) -> SourceId {
        self.base.root_id()
    }
}

impl Drop for RateLimitedLayer {
    fn drop(&mut self) {
        self.bucket.remove();
        self.base
            .next()
            .set_event_handler(None, SocketEventFlags::EMPTY);
    }
}

impl fmt::Debug for RateLimitedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedLayer")
            .field("bucket", &self.bucket)
            .finish()
    }
}

// ---------------------------------------------------------------------------

struct CompoundObserver {
    layer: Weak<CompoundRateLimitedLayer>,
    waiting: [AtomicBool; 2],
}

impl BucketObserver for CompoundObserver {
    fn wakeup(&self, direction: Direction) {
        if !self.waiting[direction as usize].swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(layer) = self.layer.upgrade() {
            let flag = match direction {
                Direction::Inbound => SocketEventFlag::Read,
                Direction::Outbound => SocketEventFlag::Write,
            };
            layer.base.forward_socket_event(flag, 0);
        }
    }
}

struct CompoundEntry {
    limiter: Arc<LimiterShared>,
    bucket: Bucket,
    observer: Arc<CompoundObserver>,
}

/// A compound rate-limited socket layer.
///
/// Any number of limiters can be attached and removed at runtime; transfers
/// are capped by the minimum availability across all attached buckets and
/// consumed from each of them.
pub struct CompoundRateLimitedLayer {
    base: LayerBase,
    entries: Mutex<Vec<CompoundEntry>>,
}

impl CompoundRateLimitedLayer {
    /// Creates the layer on top of `next`.
    pub fn new(
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
        next: Arc<dyn SocketInterface>,
    ) -> Arc<CompoundRateLimitedLayer> {
        let layer = Arc::new(CompoundRateLimitedLayer {
            base: LayerBase::new(event_loop, None, next),
            entries: Mutex::new(Vec::new()),
        });
        layer.base.set_event_passthrough(handler);
        layer
    }

    /// Attaches `limiter`. No effect if it is already attached.
    pub fn add_limiter(self: &Arc<Self>, limiter: &RateLimiter) {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| Arc::ptr_eq(&e.limiter, limiter.shared()))
        {
            return;
        }

        let observer = Arc::new(CompoundObserver {
            layer: Arc::downgrade(self),
            waiting: [AtomicBool::new(false), AtomicBool::new(false)],
        });
        let bucket = Bucket::new();
        let weak: Weak<dyn BucketObserver> = Arc::downgrade(&observer) as Weak<dyn BucketObserver>;
        bucket.set_observer(weak);
        limiter.add_bucket(&bucket);
        entries.push(CompoundEntry {
            limiter: Arc::clone(limiter.shared()),
            bucket,
            observer,
        });
    }

    /// Detaches `limiter`, waking the layer in case it was blocked on it.
    pub fn remove_limiter(&self, limiter: &RateLimiter) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            match entries
                .iter()
                .position(|e| Arc::ptr_eq(&e.limiter, limiter.shared()))
            {
                Some(idx) => entries.swap_remove(idx),
                None => return,
            }
        };
        removed.bucket.remove();
        removed.observer.wakeup(Direction::Inbound);
        removed.observer.wakeup(Direction::Outbound);
    }

    fn limited_io<F>(&self, direction: Direction, len: usize, op: F) -> io::Result<usize>
    where
        F: FnOnce(usize) -> io::Result<usize>,
    {
        let entries = self.entries.lock().unwrap();
        let d = direction as usize;

        let mut max = UNLIMITED;
        let mut caps = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            entry.observer.waiting[d].store(true, Ordering::SeqCst);
            let available = entry.bucket.available(direction);
            if available == 0 {
                return Err(would_block());
            }
            entry.observer.waiting[d].store(false, Ordering::SeqCst);
            caps.push(available);
            if available < max {
                max = available;
            }
        }

        let capped = (len as u64).min(max) as usize;
        let transferred = op(capped)?;
        if transferred > 0 {
            for (entry, available) in entries.iter().zip(caps) {
                if available != UNLIMITED {
                    entry.bucket.consume(direction, transferred as u64);
                }
            }
        }
        Ok(transferred)
    }
}

impl SocketInterface for CompoundRateLimitedLayer {
    fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()> {
        self.base.next().connect(host, port, family)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.limited_io(Direction::Inbound, buf.len(), |capped| {
            self.base.next().read(&mut buf[..capped])
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.limited_io(Direction::Outbound, buf.len(), |capped| {
            self.base.next().write(&buf[..capped])
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        self.base.next().shutdown()
    }

    fn shutdown_read(&self) -> io::Result<()> {
        self.base.next().shutdown_read()
    }

    fn state(&self) -> SocketState {
        self.base.next().state()
    }

    fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        mut retrigger_block: SocketEventFlags,
    ) {
        {
            let entries = self.entries.lock().unwrap();
            for entry in entries.iter() {
                if entry.bucket.is_waiting(Direction::Inbound) {
                    retrigger_block |= SocketEventFlag::Read;
                }
                if entry.bucket.is_waiting(Direction::Outbound) {
                    retrigger_block |= SocketEventFlag::Write;
                }
            }
        }
        self.base
            .set_event_handler_passthrough(handler, retrigger_block);
    }

    fn peer_host(&self) -> String {
        self.base.next().peer_host()
    }

    fn peer_port(&self) -> io::Result<u16> {
        self.base.next().peer_port()
    }

    fn source_id(&self) -> SourceId {
        self.base.source_id()
    }

    fn root_id(&self) -> SourceId {
        self.base.root_id()
    }
}

impl Drop for CompoundRateLimitedLayer {
    fn drop(&mut self) {
        for entry in self.entries.lock().unwrap().drain(..) {
            entry.bucket.remove();
        }
        self.base
            .next()
            .set_event_handler(None, SocketEventFlags::EMPTY);
    }
}

impl fmt::Debug for CompoundRateLimitedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompoundRateLimitedLayer")
            .field("limiters", &self.entries.lock().unwrap().len())
            .finish()
    }
}
