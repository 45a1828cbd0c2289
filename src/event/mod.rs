//! Typed events, event handlers and the event loop.
//!
//! Events are dispatched by derived type. Every concrete event type has a
//! stable [`EventTypeId`] which compares equal for the same type across the
//! whole process, allowing handlers to pattern-match incoming events with
//! [`same_type`] or [`dispatch`] without any `TypeId` tricks that break
//! across compilation units.
//!
//! The recommended way to define an event is a [`TypedEvent`] over a unique
//! tag type:
//!
//! ```
//! use evnet::event::{dispatch, Event, EventTag, TypedEvent};
//!
//! enum PingTag {}
//! impl EventTag for PingTag {
//!     type Value = u32;
//! }
//! type PingEvent = TypedEvent<PingTag>;
//!
//! let ev = PingEvent::new(3);
//! let ev: &dyn Event = &ev;
//! assert_eq!(dispatch::<PingTag, _, _>(ev, |n| *n), Some(3));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Mutex, OnceLock};

mod event_loop;

pub use self::event_loop::{EventLoop, QueuedEvent, TimerId};

/// A process-wide stable identifier of a concrete event type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventTypeId(usize);

// Maps a type name to a unique identifier. Type names are stable per type
// within a process, while addresses of static items are not guaranteed to
// be unique across codegen units.
static TYPE_REGISTRY: OnceLock<Mutex<HashMap<&'static str, EventTypeId>>> = OnceLock::new();

pub(crate) fn unique_type_id(name: &'static str) -> EventTypeId {
    let registry = TYPE_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap();
    let next = EventTypeId(map.len() + 1);
    *map.entry(name).or_insert(next)
}

/// Common trait of all events.
///
/// If possible, use [`TypedEvent`] instead of implementing this directly.
/// Keep events simple; in particular avoid locks in their values.
pub trait Event: Send + 'static {
    /// An identifier unique to the concrete type, equal for two events iff
    /// they have the same concrete type.
    fn derived_type(&self) -> EventTypeId;

    /// Upcast for downcasting in [`dispatch`].
    fn as_any(&self) -> &dyn Any;
}

/// Declares the payload of a [`TypedEvent`].
///
/// Instantiate with a unique (typically uninhabited) tag type per event
/// kind.
pub trait EventTag: Send + 'static {
    /// The value carried by events of this type.
    type Value: Send + 'static;
}

/// The recommended event type: a unique tag plus a value.
pub struct TypedEvent<T: EventTag> {
    /// The event value.
    pub value: T::Value,
    _tag: PhantomData<fn() -> T>,
}

impl<T: EventTag> TypedEvent<T> {
    /// Creates an event carrying `value`.
    pub fn new(value: T::Value) -> TypedEvent<T> {
        TypedEvent {
            value,
            _tag: PhantomData,
        }
    }

    /// The identifier all events with this tag share.
    pub fn type_id() -> EventTypeId {
        unique_type_id(std::any::type_name::<T>())
    }
}

impl<T: EventTag> Event for TypedEvent<T> {
    fn derived_type(&self) -> EventTypeId {
        Self::type_id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: EventTag> fmt::Debug for TypedEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedEvent")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Returns whether `ev`'s concrete type is `TypedEvent<T>`.
pub fn same_type<T: EventTag>(ev: &dyn Event) -> bool {
    ev.derived_type() == TypedEvent::<T>::type_id()
}

/// Calls `f` with the event value if `ev` is a `TypedEvent<T>`.
pub fn dispatch<T, F, R>(ev: &dyn Event, f: F) -> Option<R>
where
    T: EventTag,
    F: FnOnce(&T::Value) -> R,
{
    if same_type::<T>(ev) {
        ev.as_any()
            .downcast_ref::<TypedEvent<T>>()
            .map(|ev| f(&ev.value))
    } else {
        None
    }
}

/// Receives events from an [`EventLoop`].
///
/// Handlers are shared as `Arc<dyn EventHandler>`; the Arc pointer is their
/// identity for [`EventLoop::remove_handler`] and event filtering. A handler
/// may be the target of events from multiple sources, and `on_event` is only
/// ever executed by one thread at a time per loop.
///
/// Before a handler is dropped for good, [`EventLoop::remove_handler`] must
/// be called to drain pending events and timers targeting it.
pub trait EventHandler: Send + Sync {
    /// Called by the event loop for each dispatched event.
    fn on_event(&self, event: &dyn Event);
}

/// All timer events carry the [`TimerId`] of the timer that fired.
#[derive(Debug)]
pub enum TimerTag {}

impl EventTag for TimerTag {
    type Value = TimerId;
}

/// The event sent when a timer fires.
pub type TimerEvent = TypedEvent<TimerTag>;

#[cfg(test)]
mod tests {
    use super::*;

    enum FooTag {}
    impl EventTag for FooTag {
        type Value = (u32, String);
    }

    enum BarTag {}
    impl EventTag for BarTag {
        type Value = u32;
    }

    #[test]
    fn type_ids_are_stable_and_distinct() {
        let a = TypedEvent::<FooTag>::type_id();
        let b = TypedEvent::<BarTag>::type_id();
        assert_ne!(a, b);
        assert_eq!(a, TypedEvent::<FooTag>::type_id());
    }

    #[test]
    fn dispatch_by_derived_type() {
        let ev = TypedEvent::<FooTag>::new((7, "seven".to_owned()));
        let ev: &dyn Event = &ev;

        assert!(same_type::<FooTag>(ev));
        assert!(!same_type::<BarTag>(ev));

        let got = dispatch::<FooTag, _, _>(ev, |(n, s)| (*n, s.clone()));
        assert_eq!(got, Some((7, "seven".to_owned())));
        assert!(dispatch::<BarTag, _, _>(ev, |n| *n).is_none());
    }
}
