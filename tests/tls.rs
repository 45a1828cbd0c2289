use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};

use evnet::event::dispatch;
use evnet::net::SocketEventTag;
use evnet::tls::{load_certificates, TlsLayer, TlsServerFlags};
use evnet::{
    AddressFamily, Event, EventHandler, EventLoop, ListenSocket, Socket, SocketEventFlag,
    SocketInterface, ThreadPool,
};

mod util;

use util::{Driver, Mode};

struct TlsFixture {
    pool: ThreadPool,
    event_loop: EventLoop,
    key_pem: String,
    cert_pem: String,
    cert_der: Vec<u8>,
}

impl TlsFixture {
    fn new() -> TlsFixture {
        util::init();
        let pool = ThreadPool::new();
        let event_loop = EventLoop::spawn(&pool);
        let (key_pem, cert_pem) = evnet::tls::generate_selfsigned_certificate(
            "",
            "CN=localhost,O=evnet test",
            &["localhost".to_owned()],
        )
        .expect("cannot generate certificate");
        let cert_der = load_certificates(cert_pem.as_bytes(), true, false).unwrap()[0]
            .raw_data()
            .to_vec();
        TlsFixture {
            pool,
            event_loop,
            key_pem,
            cert_pem,
            cert_der,
        }
    }
}

/// Accepts one connection and starts a TLS server handshake on it.
struct TlsAcceptor {
    fixture_pool: ThreadPool,
    event_loop: EventLoop,
    listener: Mutex<Option<Arc<ListenSocket>>>,
    driver: Arc<Driver>,
    key_pem: String,
    cert_pem: String,
    resume: Vec<u8>,
    flags: TlsServerFlags,
    alpn: Vec<String>,
    server: Mutex<Option<(Arc<Socket>, Arc<TlsLayer>)>>,
}

impl TlsAcceptor {
    fn new(
        fixture: &TlsFixture,
        driver: Arc<Driver>,
        resume: Vec<u8>,
        alpn: Vec<String>,
    ) -> Arc<TlsAcceptor> {
        Arc::new(TlsAcceptor {
            fixture_pool: fixture.pool.clone(),
            event_loop: fixture.event_loop.clone(),
            listener: Mutex::new(None),
            driver,
            key_pem: fixture.key_pem.clone(),
            cert_pem: fixture.cert_pem.clone(),
            resume,
            flags: TlsServerFlags::NONE,
            alpn,
            server: Mutex::new(None),
        })
    }

    fn tls(&self) -> Option<Arc<TlsLayer>> {
        self.server.lock().unwrap().as_ref().map(|(_, tls)| tls.clone())
    }
}

impl EventHandler for TlsAcceptor {
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
        let Ok(socket) = listener.accept(&self.fixture_pool, None) else {
            return;
        };
        let socket = Arc::new(socket);

        let handler: Arc<dyn EventHandler> = self.driver.clone();
        let tls = TlsLayer::new(&self.event_loop, Some(handler), socket.clone(), None);
        tls.set_certificate(self.key_pem.as_bytes(), self.cert_pem.as_bytes(), true)
            .expect("cannot load certificate");
        if !self.alpn.is_empty() {
            tls.set_alpn(&self.alpn, true);
        }
        tls.server_handshake(&self.resume, b"", self.flags)
            .expect("cannot start server handshake");

        self.driver.attach(tls.clone());
        *self.server.lock().unwrap() = Some((socket, tls));
    }
}

fn start_tls_listener(fixture: &TlsFixture, acceptor: &Arc<TlsAcceptor>) -> u16 {
    let handler: Arc<dyn EventHandler> = acceptor.clone();
    let listener = Arc::new(
        ListenSocket::new(&fixture.pool, &fixture.event_loop, Some(handler))
            .expect("cannot create listen socket"),
    );
    listener.bind("127.0.0.1".parse().unwrap());
    listener
        .listen(AddressFamily::Ipv4, 0)
        .expect("cannot listen");
    let port = listener.local_port().unwrap();
    *acceptor.listener.lock().unwrap() = Some(listener);
    port
}

/// Connects a TLS client pinned to `cert`, driving `driver`.
fn connect_tls_client(
    fixture: &TlsFixture,
    driver: &Arc<Driver>,
    port: u16,
    pin: &[u8],
    resume: &[u8],
    alpn: &[String],
) -> (Arc<Socket>, Arc<TlsLayer>) {
    let socket = Arc::new(
        Socket::new(&fixture.pool, &fixture.event_loop, None).expect("cannot create socket"),
    );
    let handler: Arc<dyn EventHandler> = driver.clone();
    let tls = TlsLayer::new(&fixture.event_loop, Some(handler), socket.clone(), None);
    if !alpn.is_empty() {
        tls.set_alpn(alpn, false);
    }
    tls.client_handshake(pin, resume, "localhost")
        .expect("cannot start client handshake");
    driver.attach(tls.clone());
    socket
        .connect("127.0.0.1", port, AddressFamily::Unknown)
        .expect("cannot start connecting");
    (socket, tls)
}

#[test]
fn tls_echo_with_pinned_certificate() {
    let fixture = TlsFixture::new();
    let mut payload = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let server_driver = Driver::new_with_shutdown_read(Mode::Echo, Vec::new());
    let acceptor = TlsAcceptor::new(&fixture, server_driver.clone(), Vec::new(), Vec::new());
    let port = start_tls_listener(&fixture, &acceptor);

    let client_driver = Driver::new_with_shutdown_read(Mode::SendAndReceive, payload.clone());
    let (_socket, _tls) = connect_tls_client(
        &fixture,
        &client_driver,
        port,
        &fixture.cert_der,
        &[],
        &[],
    );

    assert!(client_driver.wait_finished(Duration::from_secs(20)));
    assert_eq!(client_driver.error(), 0, "client failed");
    assert!(server_driver.wait_finished(Duration::from_secs(20)));
    assert_eq!(server_driver.error(), 0, "server failed");

    assert_eq!(
        Sha256::digest(&client_driver.received()),
        Sha256::digest(&payload),
    );
    assert_eq!(
        Sha256::digest(&server_driver.received()),
        Sha256::digest(&payload),
    );

    fixture.event_loop.stop();
}

#[test]
fn tls_pin_mismatch_fails_handshake() {
    let fixture = TlsFixture::new();

    let server_driver = Driver::new(Mode::Echo, Vec::new());
    let acceptor = TlsAcceptor::new(&fixture, server_driver.clone(), Vec::new(), Vec::new());
    let port = start_tls_listener(&fixture, &acceptor);

    // A pin for a different certificate.
    let (_key, other_cert) = evnet::tls::generate_selfsigned_certificate(
        "",
        "CN=somewhere.else,O=evnet test",
        &["somewhere.else".to_owned()],
    )
    .unwrap();
    let other_der = load_certificates(other_cert.as_bytes(), true, false).unwrap()[0]
        .raw_data()
        .to_vec();

    let client_driver = Driver::new(Mode::SendAndReceive, b"never sent".to_vec());
    let (_socket, _tls) =
        connect_tls_client(&fixture, &client_driver, port, &other_der, &[], &[]);

    assert!(client_driver.wait_finished(Duration::from_secs(10)));
    assert_ne!(client_driver.error(), 0, "handshake should have failed");

    fixture.event_loop.stop();
}

#[test]
fn tls_session_resumption() {
    let fixture = TlsFixture::new();
    let alpn = vec!["evnet/1".to_owned()];

    // First connection: full handshake, remember the session parameters.
    let server_driver = Driver::new_with_shutdown_read(Mode::Echo, Vec::new());
    let acceptor = TlsAcceptor::new(&fixture, server_driver.clone(), Vec::new(), alpn.clone());
    let port = start_tls_listener(&fixture, &acceptor);

    let client_driver = Driver::new_with_shutdown_read(Mode::SendAndReceive, b"first".to_vec());
    let (_socket, client_tls) = connect_tls_client(
        &fixture,
        &client_driver,
        port,
        &fixture.cert_der,
        &[],
        &alpn,
    );

    assert!(client_driver.wait_finished(Duration::from_secs(10)));
    assert_eq!(client_driver.error(), 0);
    assert!(!client_tls.resumed_session());
    assert_eq!(client_tls.alpn().as_deref(), Some("evnet/1"));

    let client_session = client_tls.get_session_parameters();
    let server_session = acceptor
        .tls()
        .expect("server handshake never ran")
        .get_session_parameters();
    assert!(!client_session.is_empty());
    assert!(!server_session.is_empty());

    // Second connection, passing both sides their previous parameters.
    let server_driver2 = Driver::new_with_shutdown_read(Mode::Echo, Vec::new());
    let acceptor2 =
        TlsAcceptor::new(&fixture, server_driver2.clone(), server_session, alpn.clone());
    let port2 = start_tls_listener(&fixture, &acceptor2);

    let client_driver2 = Driver::new_with_shutdown_read(Mode::SendAndReceive, b"second".to_vec());
    let (_socket2, client_tls2) = connect_tls_client(
        &fixture,
        &client_driver2,
        port2,
        &fixture.cert_der,
        &client_session,
        &alpn,
    );

    assert!(client_driver2.wait_finished(Duration::from_secs(10)));
    assert_eq!(client_driver2.error(), 0);

    assert!(client_tls2.resumed_session(), "client session not resumed");
    let server_tls2 = acceptor2.tls().unwrap();
    assert!(server_tls2.resumed_session(), "server session not resumed");
    assert_eq!(client_tls2.alpn().as_deref(), Some("evnet/1"));
    assert_eq!(server_tls2.alpn().as_deref(), Some("evnet/1"));
    assert_eq!(client_tls2.protocol(), "TLS1.3");

    fixture.event_loop.stop();
}

#[test]
fn tls_graceful_shutdown_without_truncation() {
    let fixture = TlsFixture::new();
    let mut payload = vec![0u8; 64 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let server_driver = Driver::new_with_shutdown_read(Mode::Echo, Vec::new());
    let acceptor = TlsAcceptor::new(&fixture, server_driver.clone(), Vec::new(), Vec::new());
    let port = start_tls_listener(&fixture, &acceptor);

    let client_driver = Driver::new_with_shutdown_read(Mode::SendAndReceive, payload.clone());
    let (_socket, client_tls) = connect_tls_client(
        &fixture,
        &client_driver,
        port,
        &fixture.cert_der,
        &[],
        &[],
    );

    assert!(client_driver.wait_finished(Duration::from_secs(20)));
    assert!(server_driver.wait_finished(Duration::from_secs(20)));
    assert_eq!(client_driver.error(), 0);
    assert_eq!(server_driver.error(), 0);

    // Closure alerts exchanged in both directions, nothing truncated.
    assert_eq!(client_driver.received().len(), payload.len());
    assert_eq!(server_driver.received().len(), payload.len());
    assert_eq!(client_tls.state(), evnet::SocketState::ShutDown);

    fixture.event_loop.stop();
}
