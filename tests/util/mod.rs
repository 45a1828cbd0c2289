//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use evnet::event::dispatch;
use evnet::net::SocketEventTag;
use evnet::{Event, EventHandler, SocketEventFlag, SocketInterface};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What a [`Driver`] does with the connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Send `to_send`, shut the write side down, read until EOF.
    SendAndReceive,
    /// Echo everything read back until EOF, then shut down.
    Echo,
    /// Read until EOF without sending.
    Sink,
    /// Keep sending `to_send` over and over, never shutting down.
    Flood,
}

#[derive(Default)]
pub struct DriverState {
    pub to_send: Vec<u8>,
    sent: usize,
    pub total_sent: u64,
    pub received: Vec<u8>,
    out_queue: Vec<u8>,
    out_pos: usize,
    pub connected: bool,
    pub eof_seen: bool,
    shutdown_done: bool,
    shutdown_read_done: bool,
    pub finished: bool,
    pub error: i32,
}

/// An event handler driving one side of a connection through any
/// [`SocketInterface`], honoring the edge-triggered contract: every
/// operation is repeated until it returns `WouldBlock`, and only then the
/// next event is awaited.
pub struct Driver {
    mode: Mode,
    use_shutdown_read: bool,
    io: Mutex<Option<Arc<dyn SocketInterface>>>,
    state: Mutex<DriverState>,
    cond: Condvar,
}

impl Driver {
    pub fn new(mode: Mode, to_send: Vec<u8>) -> Arc<Driver> {
        Arc::new(Driver {
            mode,
            use_shutdown_read: false,
            io: Mutex::new(None),
            state: Mutex::new(DriverState {
                to_send,
                ..DriverState::default()
            }),
            cond: Condvar::new(),
        })
    }

    /// Like [`Driver::new`], but confirming the peer's EOF with
    /// `shutdown_read` before finishing (for layered stacks).
    pub fn new_with_shutdown_read(mode: Mode, to_send: Vec<u8>) -> Arc<Driver> {
        Arc::new(Driver {
            mode,
            use_shutdown_read: true,
            io: Mutex::new(None),
            state: Mutex::new(DriverState {
                to_send,
                ..DriverState::default()
            }),
            cond: Condvar::new(),
        })
    }

    /// Attaches the interface to drive. For interfaces that emit no
    /// connection event (e.g. accepted sockets), follow up with
    /// [`Driver::mark_connected`].
    pub fn attach(&self, io: Arc<dyn SocketInterface>) {
        *self.io.lock().unwrap() = Some(io);
    }

    pub fn mark_connected(&self) {
        let io = self.io.lock().unwrap().clone();
        if let Some(io) = io {
            let mut state = self.state.lock().unwrap();
            state.connected = true;
            self.pump_write(&io, &mut state);
            self.pump_read(&io, &mut state);
            self.cond.notify_all();
        }
    }

    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.connected {
            let now = Instant::now();
            if now >= deadline || state.error != 0 {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn total_sent(&self) -> u64 {
        self.state.lock().unwrap().total_sent
    }

    pub fn error(&self) -> i32 {
        self.state.lock().unwrap().error
    }

    fn fail(&self, state: &mut DriverState, error: i32) {
        state.error = error;
        state.finished = true;
        self.cond.notify_all();
    }

    fn pump_read(&self, io: &Arc<dyn SocketInterface>, state: &mut DriverState) {
        if state.finished {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match io.read(&mut buf) {
                Ok(0) => {
                    state.eof_seen = true;
                    if self.use_shutdown_read && !state.shutdown_read_done {
                        match io.shutdown_read() {
                            Ok(()) => state.shutdown_read_done = true,
                            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(err) => {
                                self.fail(state, err.raw_os_error().unwrap_or(-1));
                                return;
                            }
                        }
                    }
                    break;
                }
                Ok(n) => {
                    state.received.extend_from_slice(&buf[..n]);
                    if self.mode == Mode::Echo {
                        state.out_queue.extend_from_slice(&buf[..n]);
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail(state, err.raw_os_error().unwrap_or(-1));
                    return;
                }
            }
        }

        if self.mode == Mode::Echo {
            self.pump_write(io, state);
        }
        self.check_finished(state);
    }

    fn pump_write(&self, io: &Arc<dyn SocketInterface>, state: &mut DriverState) {
        if state.finished || !state.connected {
            return;
        }

        match self.mode {
            Mode::SendAndReceive | Mode::Flood => {
                while state.sent < state.to_send.len()
                    || (self.mode == Mode::Flood && !state.to_send.is_empty())
                {
                    if state.sent == state.to_send.len() {
                        // Flood restarts from the top.
                        state.sent = 0;
                    }
                    let to_send = &state.to_send[state.sent..];
                    match io.write(to_send) {
                        Ok(n) => {
                            state.sent += n;
                            state.total_sent += n as u64;
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            self.fail(state, err.raw_os_error().unwrap_or(-1));
                            return;
                        }
                    }
                }
                if self.mode == Mode::SendAndReceive && !state.shutdown_done {
                    match io.shutdown() {
                        Ok(()) => state.shutdown_done = true,
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            self.fail(state, err.raw_os_error().unwrap_or(-1));
                            return;
                        }
                    }
                }
            }
            Mode::Echo => {
                while state.out_pos < state.out_queue.len() {
                    let chunk = &state.out_queue[state.out_pos..];
                    match io.write(chunk) {
                        Ok(n) => {
                            state.out_pos += n;
                            state.total_sent += n as u64;
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            self.fail(state, err.raw_os_error().unwrap_or(-1));
                            return;
                        }
                    }
                }
                // All echoed; half-close once the peer is done sending.
                if state.eof_seen && !state.shutdown_done {
                    match io.shutdown() {
                        Ok(()) => state.shutdown_done = true,
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            self.fail(state, err.raw_os_error().unwrap_or(-1));
                            return;
                        }
                    }
                }
            }
            Mode::Sink => {}
        }

        self.check_finished(state);
    }

    fn check_finished(&self, state: &mut DriverState) {
        let shutdown_ok = match self.mode {
            Mode::SendAndReceive | Mode::Echo => state.shutdown_done,
            Mode::Sink | Mode::Flood => true,
        };
        let read_confirmed = !self.use_shutdown_read || state.shutdown_read_done;
        if state.eof_seen && shutdown_ok && read_confirmed && !state.finished {
            state.finished = true;
            self.cond.notify_all();
        }
    }
}

impl EventHandler for Driver {
    fn on_event(&self, event: &dyn Event) {
        let Some((_, flag, error)) =
            dispatch::<SocketEventTag, _, _>(event, |value| *value)
        else {
            return;
        };

        let io = self.io.lock().unwrap().clone();
        let Some(io) = io else { return };
        let mut state = self.state.lock().unwrap();

        if error != 0 {
            self.fail(&mut state, error);
            return;
        }

        match flag {
            SocketEventFlag::Connection => {
                state.connected = true;
                self.cond.notify_all();
                self.pump_write(&io, &mut state);
            }
            SocketEventFlag::Read => {
                // Readiness events only arrive on established connections.
                state.connected = true;
                self.pump_read(&io, &mut state);
            }
            SocketEventFlag::Write => {
                state.connected = true;
                self.cond.notify_all();
                self.pump_write(&io, &mut state);
            }
            SocketEventFlag::ConnectionNext => {}
        }
    }
}
