use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};

use evnet::event::dispatch;
use evnet::net::SocketEventTag;
use evnet::{
    AddressFamily, Event, EventHandler, EventLoop, ListenSocket, Socket, SocketEventFlag,
    ThreadPool,
};

mod util;

use util::{Driver, Mode};

/// Accepts a single connection and hands it to a driver.
struct Acceptor {
    pool: ThreadPool,
    listener: Mutex<Option<Arc<ListenSocket>>>,
    driver: Arc<Driver>,
    accepted: Mutex<Option<Arc<Socket>>>,
}

impl Acceptor {
    fn new(pool: &ThreadPool, driver: Arc<Driver>) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            pool: pool.clone(),
            listener: Mutex::new(None),
            driver,
            accepted: Mutex::new(None),
        })
    }
}

impl EventHandler for Acceptor {
    fn on_event(&self, event: &dyn Event) {
        let Some((_, flag, error)) = dispatch::<SocketEventTag, _, _>(event, |v| *v) else {
            return;
        };
        if flag != SocketEventFlag::Connection || error != 0 {
            return;
        }
        let listener = self.listener.lock().unwrap();
        let Some(listener) = listener.as_ref() else {
            return;
        };
        let handler: Arc<dyn EventHandler> = self.driver.clone();
        if let Ok(socket) = listener.accept(&self.pool, Some(handler)) {
            let socket = Arc::new(socket);
            self.driver.attach(socket.clone());
            *self.accepted.lock().unwrap() = Some(socket);
            self.driver.mark_connected();
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn start_listener(
    pool: &ThreadPool,
    event_loop: &EventLoop,
    acceptor: &Arc<Acceptor>,
) -> (Arc<ListenSocket>, u16) {
    let handler: Arc<dyn EventHandler> = acceptor.clone();
    let listener = Arc::new(
        ListenSocket::new(pool, event_loop, Some(handler)).expect("cannot create listen socket"),
    );
    listener.bind("127.0.0.1".parse().unwrap());
    listener
        .listen(AddressFamily::Ipv4, 0)
        .expect("cannot listen");
    let port = listener.local_port().expect("cannot get listen port");
    *acceptor.listener.lock().unwrap() = Some(listener.clone());
    (listener, port)
}

#[test]
fn tcp_echo_round_trip() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);

    let payload = random_bytes(16 * 1024);

    let server_driver = Driver::new(Mode::Echo, Vec::new());
    let acceptor = Acceptor::new(&pool, server_driver.clone());
    let (_listener, port) = start_listener(&pool, &event_loop, &acceptor);

    let client_driver = Driver::new(Mode::SendAndReceive, payload.clone());
    let client_handler: Arc<dyn EventHandler> = client_driver.clone();
    let client = Arc::new(
        Socket::new(&pool, &event_loop, Some(client_handler)).expect("cannot create socket"),
    );
    client_driver.attach(client.clone());
    client
        .connect("127.0.0.1", port, AddressFamily::Unknown)
        .expect("cannot start connecting");

    assert!(client_driver.wait_finished(Duration::from_secs(10)));
    assert_eq!(client_driver.error(), 0, "client failed");
    assert_eq!(client_driver.received(), payload);

    assert!(server_driver.wait_finished(Duration::from_secs(10)));
    assert_eq!(server_driver.error(), 0, "server failed");
    assert_eq!(server_driver.received(), payload);

    event_loop.stop();
}

#[test]
fn tcp_full_duplex_integrity() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);

    let client_payload = random_bytes(1024 * 1024);
    let server_payload = random_bytes(1024 * 1024 + 333);

    let server_driver = Driver::new(Mode::SendAndReceive, server_payload.clone());
    let acceptor = Acceptor::new(&pool, server_driver.clone());
    let (_listener, port) = start_listener(&pool, &event_loop, &acceptor);

    let client_driver = Driver::new(Mode::SendAndReceive, client_payload.clone());
    let client_handler: Arc<dyn EventHandler> = client_driver.clone();
    let client = Arc::new(
        Socket::new(&pool, &event_loop, Some(client_handler)).expect("cannot create socket"),
    );
    client_driver.attach(client.clone());
    client
        .connect("127.0.0.1", port, AddressFamily::Ipv4)
        .expect("cannot start connecting");

    assert!(client_driver.wait_finished(Duration::from_secs(30)));
    assert!(server_driver.wait_finished(Duration::from_secs(30)));
    assert_eq!(client_driver.error(), 0);
    assert_eq!(server_driver.error(), 0);

    // Both directions arrive unmodified.
    assert_eq!(
        Sha256::digest(&client_driver.received()),
        Sha256::digest(&server_payload),
    );
    assert_eq!(
        Sha256::digest(&server_driver.received()),
        Sha256::digest(&client_payload),
    );

    event_loop.stop();
}

#[test]
fn fast_accept_descriptor_handoff() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);

    // The acceptor side runs on a second loop, as in a descriptor-handoff
    // setup.
    let other_loop = EventLoop::spawn(&pool);

    // No handler on the listener; the test polls fast_accept directly.
    let server_driver = Driver::new(Mode::Echo, Vec::new());
    let listener =
        Arc::new(ListenSocket::new(&pool, &event_loop, None).expect("cannot create listen socket"));
    listener.bind("127.0.0.1".parse().unwrap());
    listener
        .listen(AddressFamily::Ipv4, 0)
        .expect("cannot listen");
    let port = listener.local_port().expect("cannot get listen port");

    let client_driver = Driver::new(Mode::SendAndReceive, b"descriptor handoff".to_vec());
    let client_handler: Arc<dyn EventHandler> = client_driver.clone();
    let client = Arc::new(
        Socket::new(&pool, &event_loop, Some(client_handler)).expect("cannot create socket"),
    );
    client_driver.attach(client.clone());
    client
        .connect("127.0.0.1", port, AddressFamily::Unknown)
        .expect("cannot start connecting");

    // Accept manually via the raw descriptor instead of the acceptor
    // handler.
    let descriptor = loop {
        match listener.fast_accept() {
            Ok(descriptor) => break descriptor,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("fast_accept failed: {}", err),
        }
    };

    let handler: Arc<dyn EventHandler> = server_driver.clone();
    let server =
        Arc::new(Socket::from_descriptor(descriptor, &pool, &other_loop, Some(handler)).unwrap());
    server_driver.attach(server.clone());
    server_driver.mark_connected();

    assert!(client_driver.wait_finished(Duration::from_secs(10)));
    assert_eq!(client_driver.received(), b"descriptor handoff");

    event_loop.stop();
    other_loop.stop();
}
