//! Single threaded cooperative event loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use log::trace;

use crate::event::{Event, EventHandler, TimerEvent};
use crate::pool::{AsyncTask, ThreadPool};

/// Identifies a timer of an [`EventLoop`].
///
/// Ids are never reused within a loop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

/// An event queued for a handler, as seen by [`EventLoop::filter_events`].
pub struct QueuedEvent {
    /// The handler the event is addressed to.
    pub handler: Arc<dyn EventHandler>,
    /// The event itself.
    pub event: Box<dyn Event>,
}

impl QueuedEvent {
    /// Whether this event is addressed to `handler`.
    pub fn is_for(&self, handler: &Arc<dyn EventHandler>) -> bool {
        handler_addr(&self.handler) == handler_addr(handler)
    }
}

impl fmt::Debug for QueuedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedEvent").finish()
    }
}

struct Timer {
    id: TimerId,
    handler: Arc<dyn EventHandler>,
    deadline: Instant,
    interval: Duration,
    one_shot: bool,
}

struct LoopState {
    queue: VecDeque<QueuedEvent>,
    timers: Vec<Timer>,
    next_timer_id: u64,
    // Handler currently being dispatched to, by address, and the thread
    // doing it. remove_handler waits on these.
    dispatching: Option<usize>,
    dispatch_thread: Option<ThreadId>,
    stop: bool,
    task: Option<AsyncTask>,
}

struct Inner {
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// A single-threaded cooperative event loop.
///
/// Owns a FIFO of `(handler, event)` pairs and a set of timers. At most one
/// event is dispatched at a time; handlers may send further events, add or
/// stop timers and remove handlers from within a dispatch.
///
/// Events for a given handler are delivered in the order they were queued.
/// After [`EventLoop::remove_handler`] returns, the removed handler receives
/// no further events and no dispatch is executing on it.
///
/// `EventLoop` is a cheap-to-clone handle; clones refer to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

fn handler_addr(handler: &Arc<dyn EventHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

impl EventLoop {
    /// Creates a loop which is not running anywhere yet. Drive it with
    /// [`EventLoop::run`].
    pub fn new() -> EventLoop {
        EventLoop {
            inner: Arc::new(Inner {
                state: Mutex::new(LoopState {
                    queue: VecDeque::new(),
                    timers: Vec::new(),
                    next_timer_id: 0,
                    dispatching: None,
                    dispatch_thread: None,
                    stop: false,
                    task: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a loop running on a worker thread of `pool`.
    ///
    /// The loop runs until [`EventLoop::stop`] is called; the worker is
    /// joined by [`EventLoop::stop`] when invoked from another thread.
    pub fn spawn(pool: &ThreadPool) -> EventLoop {
        let event_loop = EventLoop::new();
        let run = event_loop.clone();
        let task = pool.spawn(move || run.run());
        event_loop
            .inner
            .state
            .lock()
            .unwrap()
            .task
            .replace(task);
        event_loop
    }

    /// Enqueues `event` for `handler` at the tail of the queue and wakes the
    /// loop if idle. Thread-safe and non-blocking.
    pub fn send(&self, handler: &Arc<dyn EventHandler>, event: Box<dyn Event>) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(QueuedEvent {
            handler: Arc::clone(handler),
            event,
        });
        self.inner.cond.notify_all();
    }

    /// Adds a timer firing every `interval` (or once after `interval` if
    /// `one_shot`), delivering a [`TimerEvent`] to `handler`.
    ///
    /// Timers use a monotonic clock and are unaffected by wall-clock
    /// changes. A periodic timer may skip firings when the loop is busy but
    /// never fires twice for one interval.
    pub fn add_timer(
        &self,
        handler: &Arc<dyn EventHandler>,
        interval: Duration,
        one_shot: bool,
    ) -> TimerId {
        let mut state = self.inner.state.lock().unwrap();
        state.next_timer_id += 1;
        let id = TimerId(state.next_timer_id);
        state.timers.push(Timer {
            id,
            handler: Arc::clone(handler),
            deadline: Instant::now() + interval,
            interval,
            one_shot,
        });
        self.inner.cond.notify_all();
        id
    }

    /// Stops a timer. No effect if it already fired and was one-shot;
    /// idempotent.
    pub fn stop_timer(&self, id: TimerId) {
        let mut state = self.inner.state.lock().unwrap();
        state.timers.retain(|t| t.id != id);
    }

    /// Atomically filters the queued events, before the next dispatch.
    ///
    /// `f` may mutate each entry (e.g. re-address it to another handler);
    /// returning `true` removes the entry from the queue.
    pub fn filter_events<F>(&self, mut f: F)
    where
        F: FnMut(&mut QueuedEvent) -> bool,
    {
        let mut state = self.inner.state.lock().unwrap();
        let old = std::mem::take(&mut state.queue);
        for mut entry in old {
            if !f(&mut entry) {
                state.queue.push_back(entry);
            }
        }
    }

    /// Removes all queued events and timers for `handler` and waits until no
    /// dispatch is executing on it.
    ///
    /// After this returns the handler receives no further events. Calling it
    /// from within the handler's own dispatch is allowed and does not
    /// deadlock.
    pub fn remove_handler(&self, handler: &Arc<dyn EventHandler>) {
        let addr = handler_addr(handler);
        let mut state = self.inner.state.lock().unwrap();
        state.queue.retain(|entry| handler_addr(&entry.handler) != addr);
        state.timers.retain(|t| handler_addr(&t.handler) != addr);

        let current = std::thread::current().id();
        while state.dispatching == Some(addr) && state.dispatch_thread != Some(current) {
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    /// Tells the loop to return from [`EventLoop::run`] after the current
    /// dispatch, joining the worker if the loop was [spawned].
    ///
    /// [spawned]: EventLoop::spawn
    pub fn stop(&self) {
        let task = {
            let mut state = self.inner.state.lock().unwrap();
            state.stop = true;
            self.inner.cond.notify_all();
            if state.dispatch_thread == Some(std::thread::current().id()) {
                // Stopping from within a handler; the worker joins itself on
                // drop of the loop's task elsewhere, never here.
                None
            } else {
                state.task.take()
            }
        };
        drop(task);
    }

    /// Runs the loop on the calling thread until [`EventLoop::stop`].
    ///
    /// Dequeues and dispatches one event at a time; when the queue is empty
    /// and no timer is due, blocks until signalled or the next timer fires.
    pub fn run(&self) {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.stop {
                state.stop = false;
                return;
            }

            let now = Instant::now();
            if let Some(entry) = Self::due_timer_event(&mut state, now) {
                state = self.dispatch(state, entry);
                continue;
            }
            if let Some(entry) = state.queue.pop_front() {
                state = self.dispatch(state, entry);
                continue;
            }

            match Self::next_deadline(&state) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    state = self.inner.cond.wait_timeout(state, timeout).unwrap().0;
                }
                None => {
                    state = self.inner.cond.wait(state).unwrap();
                }
            }
        }
    }

    fn dispatch<'a>(
        &'a self,
        mut state: MutexGuard<'a, LoopState>,
        entry: QueuedEvent,
    ) -> MutexGuard<'a, LoopState> {
        state.dispatching = Some(handler_addr(&entry.handler));
        state.dispatch_thread = Some(std::thread::current().id());
        drop(state);

        entry.handler.on_event(&*entry.event);

        let mut state = self.inner.state.lock().unwrap();
        state.dispatching = None;
        state.dispatch_thread = None;
        self.inner.cond.notify_all();
        state
    }

    // Produces the event for the next due timer, if any, updating or
    // removing the timer.
    fn due_timer_event(state: &mut LoopState, now: Instant) -> Option<QueuedEvent> {
        let idx = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(_, t)| t.deadline)
            .map(|(i, _)| i)?;

        let id = state.timers[idx].id;
        let handler = Arc::clone(&state.timers[idx].handler);
        if state.timers[idx].one_shot {
            state.timers.swap_remove(idx);
        } else {
            // Skip missed firings instead of bursting.
            let timer = &mut state.timers[idx];
            while timer.deadline <= now {
                timer.deadline += timer.interval;
            }
        }

        trace!("timer {:?} fired", id);
        Some(QueuedEvent {
            handler,
            event: Box::new(TimerEvent::new(id)),
        })
    }

    fn next_deadline(state: &LoopState) -> Option<Instant> {
        state.timers.iter().map(|t| t.deadline).min()
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("EventLoop")
            .field("queued", &state.queue.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}
