//! A Transport Layer Security layer for socket stacks.
//!
//! [`TlsLayer`] can be used for both client- and server-side TLS. It
//! installs itself as the event handler of the next-lower layer and becomes
//! the source of socket events for the application, with the same
//! edge-triggered contract as the raw socket.
//!
//! Session resumption is supported but has to be requested explicitly;
//! there is no shared state between unrelated sessions. Two trust models
//! are available for client-side TLS: certificates are either evaluated
//! against the system trust store, or the application decides through a
//! [`CertificateVerificationEvent`] (e.g. for trust on first use).

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info, warn};
use rustls::client::Resumption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::ServerSessionMemoryCache;
use rustls::{CipherSuite, Connection, HandshakeKind, ProtocolVersion};

mod gen;
mod info;
mod ticket;
mod trust;
mod verify;

pub use self::gen::{generate_csr, generate_selfsigned_certificate};
pub use self::info::{
    algorithm_warnings, load_certificates, parse_certificate, CertificateInfo, SubjectName,
    TlsSessionInfo,
};
pub use self::trust::SystemTrustStore;

use self::ticket::{StaticTicketer, TICKET_KEY_LEN};
use self::verify::{Captured, CapturingVerifier};
use crate::buffer::Buffer;
use crate::event::{Event, EventHandler, EventLoop, EventTag, TypedEvent};
use crate::layer::{LayerBase, SocketInterface};
use crate::net::{
    as_host_address_event, as_socket_event, change_socket_event_handler, errc, AddressFamily,
    SocketEventFlag, SocketEventFlags, SocketState, SourceId,
};

/// Largest amount of plaintext handed to the engine per write, the
/// conventional TLS record payload limit.
const MAX_TLS_RECORD: usize = 16 * 1024;

/// Stop pulling TLS data from the lower layer while this much decrypted
/// data is waiting for the application.
const MAX_BUFFERED_PLAINTEXT: usize = 64 * 1024;

/// Magic prefix of session-resumption blobs.
const SESSION_BLOB_MAGIC: &[u8; 4] = b"EVTS";
const SESSION_BLOB_VERSION: u8 = 1;

/// TLS protocol versions selectable for a session.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TlsVersion {
    /// TLS 1.0. Unsupported by the engine; clamped up to 1.2.
    V1_0,
    /// TLS 1.1. Unsupported by the engine; clamped up to 1.2.
    V1_1,
    /// TLS 1.2.
    V1_2,
    /// TLS 1.3.
    V1_3,
}

/// Flags for [`TlsLayer::server_handshake`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlsServerFlags(u32);

impl TlsServerFlags {
    /// No flags.
    pub const NONE: TlsServerFlags = TlsServerFlags(0);
    /// In TLS 1.3, do not automatically send session tickets after
    /// finishing the handshake. Ignored for other versions.
    pub const NO_AUTO_TICKET: TlsServerFlags = TlsServerFlags(0x1);

    /// Whether all flags in `other` are set.
    pub fn contains(self, other: TlsServerFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TlsServerFlags {
    type Output = TlsServerFlags;

    fn bitor(self, rhs: TlsServerFlags) -> TlsServerFlags {
        TlsServerFlags(self.0 | rhs.0)
    }
}

/// Tag of [`CertificateVerificationEvent`].
#[derive(Debug)]
pub enum CertificateVerificationTag {}

impl EventTag for CertificateVerificationTag {
    type Value = (SourceId, TlsSessionInfo);
}

/// Sent during the client handshake with details about the session and the
/// certificates presented by the server.
///
/// After receiving this event, [`TlsLayer::set_verification_result`] must
/// eventually be called; the handshake stays paused until then.
pub type CertificateVerificationEvent = TypedEvent<CertificateVerificationTag>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Role {
    Client,
    Server,
}

// Client session caches by resumption key. Resumption only works within a
// process; blobs from an earlier run are accepted and lead to a full
// handshake.
static CLIENT_SESSIONS: OnceLock<Mutex<HashMap<u64, Resumption>>> = OnceLock::new();

fn client_resumption(key: u64) -> Resumption {
    let registry = CLIENT_SESSIONS.get_or_init(|| Mutex::new(HashMap::new()));
    registry
        .lock()
        .unwrap()
        .entry(key)
        .or_insert_with(|| Resumption::in_memory_sessions(8))
        .clone()
}

struct TlsInner {
    state: SocketState,
    role: Option<Role>,
    conn: Option<Connection>,

    // Handshake-phase data.
    preamble: Buffer,
    hostname: String,
    port: u16,
    required_cert: Option<Vec<u8>>,
    verification_handler: Option<Arc<dyn EventHandler>>,
    verification_pending: bool,
    captured: Option<Arc<Mutex<Captured>>>,

    // Edge-trigger bookkeeping towards the application.
    app_waiting_read: bool,
    app_waiting_write: bool,

    // Lower-layer observations.
    socket_eof: bool,
    socket_error: i32,
    pending_plaintext: usize,
    peer_closed: bool,
    closure_alert_sent: bool,

    // Configuration.
    system_trust_store: Option<SystemTrustStore>,
    alpn: Vec<Vec<u8>>,
    alpn_server_priority: bool,
    min_version: TlsVersion,
    max_version: TlsVersion,
    cert_chain: Option<Vec<CertificateDer<'static>>>,
    key: Option<PrivateKeyDer<'static>>,
    ticket_key: Option<[u8; TICKET_KEY_LEN]>,
    resumption_key: Option<u64>,
    unexpected_eof_cb: Option<Box<dyn Fn() -> bool + Send>>,
}

/// A TLS layer on top of a socket stack.
pub struct TlsLayer {
    base: LayerBase,
    inner: Mutex<TlsInner>,
}

struct NextIo<'a> {
    next: &'a Arc<dyn SocketInterface>,
    // Distinguishes a transport EOF from the engine's own "buffer full"
    // result, which both surface as a zero read.
    saw_eof: bool,
}

impl<'a> NextIo<'a> {
    fn new(next: &'a Arc<dyn SocketInterface>) -> NextIo<'a> {
        NextIo {
            next,
            saw_eof: false,
        }
    }
}

impl Read for NextIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.next.read(buf)?;
        if n == 0 {
            self.saw_eof = true;
        }
        Ok(n)
    }
}

impl Write for NextIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.next.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn eagain() -> io::Error {
    io::Error::from_raw_os_error(errc::EAGAIN)
}

fn enotconn() -> io::Error {
    io::Error::from_raw_os_error(errc::ENOTCONN)
}

fn econnaborted() -> io::Error {
    io::Error::from_raw_os_error(errc::ECONNABORTED)
}

fn raw_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(errc::ECONNABORTED)
}

impl TlsLayer {
    /// Creates a TLS layer on top of `next`, becoming its event handler.
    /// Events for the application are emitted under this layer's source id
    /// to `handler`.
    ///
    /// With a trust store, client handshakes evaluate the peer certificate
    /// against the system trust roots.
    pub fn new(
        event_loop: &EventLoop,
        handler: Option<Arc<dyn EventHandler>>,
        next: Arc<dyn SocketInterface>,
        system_trust_store: Option<SystemTrustStore>,
    ) -> Arc<TlsLayer> {
        let layer = Arc::new(TlsLayer {
            base: LayerBase::new(event_loop, handler, next),
            inner: Mutex::new(TlsInner {
                state: SocketState::None,
                role: None,
                conn: None,
                preamble: Buffer::new(),
                hostname: String::new(),
                port: 0,
                required_cert: None,
                verification_handler: None,
                verification_pending: false,
                captured: None,
                app_waiting_read: false,
                app_waiting_write: false,
                socket_eof: false,
                socket_error: 0,
                pending_plaintext: 0,
                peer_closed: false,
                closure_alert_sent: false,
                system_trust_store,
                alpn: Vec::new(),
                alpn_server_priority: false,
                min_version: TlsVersion::V1_2,
                max_version: TlsVersion::V1_3,
                cert_chain: None,
                key: None,
                ticket_key: None,
                resumption_key: None,
                unexpected_eof_cb: None,
            }),
        });
        let self_handler: Arc<dyn EventHandler> = Arc::clone(&layer) as Arc<dyn EventHandler>;
        layer
            .base
            .next()
            .set_event_handler(Some(self_handler), SocketEventFlags::EMPTY);
        layer
    }

    // -----------------------------------------------------------------
    // Handshake entry points

    /// Starts shaking hands for a new TLS session as client, requiring the
    /// negotiated certificate to match `required_certificate` (DER or PEM).
    ///
    /// Wait for a connection event for the result. An empty pin means the
    /// decision is made solely by the system trust store.
    pub fn client_handshake(
        &self,
        required_certificate: &[u8],
        session_to_resume: &[u8],
        hostname: &str,
    ) -> io::Result<()> {
        let pin = if required_certificate.is_empty() {
            None
        } else {
            Some(normalize_certificate(required_certificate)?)
        };
        self.start_client_handshake(pin, None, session_to_resume, hostname)
    }

    /// Starts shaking hands for a new TLS session as client, asking
    /// `verification_handler` to decide trust.
    ///
    /// The handler receives a [`CertificateVerificationEvent`] upon which
    /// the handshake pauses until [`TlsLayer::set_verification_result`] is
    /// called. The handler is consulted even for certificates not trusted
    /// by the system store, with unknown issuers, expired validity and
    /// mismatched hostnames reported rather than rejected.
    pub fn client_handshake_with_verification(
        &self,
        verification_handler: &Arc<dyn EventHandler>,
        session_to_resume: &[u8],
        hostname: &str,
    ) -> io::Result<()> {
        self.start_client_handshake(
            None,
            Some(Arc::clone(verification_handler)),
            session_to_resume,
            hostname,
        )
    }

    fn start_client_handshake(
        &self,
        pin: Option<Vec<u8>>,
        verification_handler: Option<Arc<dyn EventHandler>>,
        session_to_resume: &[u8],
        hostname: &str,
    ) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SocketState::None {
            return Err(io::Error::from_raw_os_error(errc::EALREADY));
        }

        let hostname = if hostname.is_empty() {
            self.base.next().peer_host()
        } else {
            hostname.to_owned()
        };
        if hostname.is_empty() {
            return Err(io::Error::from_raw_os_error(errc::EINVAL));
        }
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| io::Error::from_raw_os_error(errc::EINVAL))?;

        let versions = selected_versions(inner.min_version, inner.max_version)?;
        let verifier = CapturingVerifier::new(inner.system_trust_store.as_ref());
        let captured = verifier.captured();

        let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));
        let mut config = match (&inner.cert_chain, &inner.key) {
            (Some(chain), Some(key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?,
            _ => builder.with_no_client_auth(),
        };

        let resumption_key = parse_client_session_blob(session_to_resume)
            .unwrap_or_else(|| rand::random::<u64>() | 1);
        config.resumption = client_resumption(resumption_key);
        config.alpn_protocols = inner.alpn.clone();

        let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;

        inner.role = Some(Role::Client);
        inner.state = SocketState::Connecting;
        inner.conn = Some(Connection::Client(conn));
        inner.hostname = hostname;
        inner.port = self.base.next().peer_port().unwrap_or(0);
        inner.required_cert = pin;
        inner.verification_handler = verification_handler;
        inner.captured = Some(captured);
        inner.resumption_key = Some(resumption_key);

        debug!("starting TLS client handshake with {}", inner.hostname);
        let _ = self.continue_handshake(&mut inner);
        Ok(())
    }

    /// Starts shaking hands for a new TLS session as server.
    ///
    /// A certificate and key must have been supplied through
    /// [`TlsLayer::set_certificate`] before. Session parameters of an
    /// earlier session enable resumption of the ticket key; the preamble is
    /// sent out before the first handshake record.
    pub fn server_handshake(
        &self,
        session_to_resume: &[u8],
        preamble: &[u8],
        flags: TlsServerFlags,
    ) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SocketState::None {
            return Err(io::Error::from_raw_os_error(errc::EALREADY));
        }
        let (chain, key) = match (&inner.cert_chain, &inner.key) {
            (Some(chain), Some(key)) => (chain.clone(), key.clone_key()),
            _ => {
                warn!("server handshake without certificate");
                return Err(io::Error::from_raw_os_error(errc::EINVAL));
            }
        };

        let ticket_key = parse_server_session_blob(session_to_resume)
            .unwrap_or_else(StaticTicketer::generate_key);

        let versions = selected_versions(inner.min_version, inner.max_version)?;
        let mut config = rustls::ServerConfig::builder_with_protocol_versions(&versions)
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

        config.ticketer = Arc::new(StaticTicketer::new(&ticket_key));
        config.session_storage = ServerSessionMemoryCache::new(256);
        config.send_tls13_tickets = if flags.contains(TlsServerFlags::NO_AUTO_TICKET) {
            0
        } else {
            1
        };
        config.alpn_protocols = inner.alpn.clone();
        config.ignore_client_order = inner.alpn_server_priority;

        let conn = rustls::ServerConnection::new(Arc::new(config))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;

        inner.role = Some(Role::Server);
        inner.state = SocketState::Connecting;
        inner.conn = Some(Connection::Server(conn));
        inner.ticket_key = Some(ticket_key);
        inner.preamble.clear();
        inner.preamble.append(preamble);

        debug!("starting TLS server handshake");
        let _ = self.continue_handshake(&mut inner);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Configuration

    /// Sets the certificate chain and private key (PEM or DER).
    ///
    /// Mandatory for servers; for clients it is the optional client
    /// certificate.
    pub fn set_certificate(&self, key: &[u8], certs: &[u8], pem: bool) -> io::Result<()> {
        let (chain, key) = if pem {
            let mut reader = io::BufReader::new(certs);
            let chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
            let mut key_reader = io::BufReader::new(key);
            let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "no private key found")
            })?;
            (chain, key)
        } else {
            let chain = vec![CertificateDer::from(certs.to_vec())];
            let key = PrivateKeyDer::try_from(key.to_vec())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            (chain, key)
        };
        if chain.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no certificates found",
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.cert_chain = Some(chain);
        inner.key = Some(key);
        Ok(())
    }

    /// Like [`TlsLayer::set_certificate`], reading key and certificates
    /// from files.
    pub fn set_certificate_file(
        &self,
        key_file: &std::path::Path,
        certs_file: &std::path::Path,
        pem: bool,
    ) -> io::Result<()> {
        let key = std::fs::read(key_file)?;
        let certs = std::fs::read(certs_file)?;
        self.set_certificate(&key, &certs, pem)
    }

    /// Negotiates an application protocol. Needs to be called prior to
    /// handshaking.
    ///
    /// If the peer uses ALPN, the handshake fails when no protocol matches;
    /// a peer without ALPN support continues with no negotiated protocol.
    /// Which protocol is chosen is always a server-side decision; with
    /// `server_priority` the server's order takes precedence over the
    /// client's (ignored when running as client).
    pub fn set_alpn(&self, protocols: &[String], server_priority: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.alpn = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        inner.alpn_server_priority = server_priority;
    }

    /// Sets the minimum allowed TLS version.
    pub fn set_min_tls_ver(&self, version: TlsVersion) {
        self.inner.lock().unwrap().min_version = version;
    }

    /// Sets the maximum allowed TLS version. Don't set a maximum in
    /// production, it is for testing things.
    pub fn set_max_tls_ver(&self, version: TlsVersion) {
        self.inner.lock().unwrap().max_version = version;
    }

    /// Sets a callback controlling whether an unexpected EOF is logged as
    /// error.
    ///
    /// With TLS, an EOF prior to receiving a closure alert is normally an
    /// error. In many cases it is harmless, e.g. on idle connections; if
    /// the callback returns false, such a termination is not logged as
    /// error. Functions such as read still return `ECONNABORTED`. The
    /// callback must not call back into the layer.
    pub fn set_unexpected_eof_callback(&self, cb: Option<Box<dyn Fn() -> bool + Send>>) {
        self.inner.lock().unwrap().unexpected_eof_cb = cb;
    }

    // -----------------------------------------------------------------
    // Verification

    /// Completes a handshake paused by a [`CertificateVerificationEvent`].
    ///
    /// Trusting the certificate resumes the session establishment even if
    /// the system trust store rejected it.
    pub fn set_verification_result(&self, trusted: bool) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.verification_pending {
            warn!("set_verification_result called at the wrong time");
            return;
        }
        inner.verification_pending = false;
        if trusted {
            self.finish_connected(&mut inner);
        } else {
            info!("certificate rejected by the verification handler");
            self.failure_locked(&mut inner, errc::ECONNABORTED, true);
        }
    }

    // -----------------------------------------------------------------
    // Session accessors

    /// After a successful handshake, whether the session was resumed.
    pub fn resumed_session(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .conn
            .as_ref()
            .and_then(|conn| conn.handshake_kind())
            .map(|kind| kind == HandshakeKind::Resumed)
            .unwrap_or(false)
    }

    /// The negotiated protocol version, e.g. `"TLS1.3"`.
    pub fn protocol(&self) -> String {
        let inner = self.inner.lock().unwrap();
        protocol_string(inner.conn.as_ref().and_then(|c| c.protocol_version()))
    }

    /// The negotiated key exchange.
    pub fn key_exchange(&self) -> String {
        let inner = self.inner.lock().unwrap();
        suite_info(&inner).1
    }

    /// The negotiated symmetric cipher.
    pub fn cipher(&self) -> String {
        let inner = self.inner.lock().unwrap();
        suite_info(&inner).0 .0
    }

    /// The negotiated MAC.
    pub fn mac(&self) -> String {
        let inner = self.inner.lock().unwrap();
        suite_info(&inner).0 .1
    }

    /// Bitmask of [`algorithm_warnings`] about weak negotiated choices.
    pub fn algorithm_warnings(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        compute_algorithm_warnings(&inner)
    }

    /// The application protocol negotiated through ALPN, if any.
    pub fn alpn(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .conn
            .as_ref()
            .and_then(|conn| conn.alpn_protocol())
            .map(|alpn| String::from_utf8_lossy(alpn).into_owned())
    }

    /// When running as server, the SNI hostname sent by the client; the
    /// configured hostname otherwise.
    pub fn hostname(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        match &inner.conn {
            Some(Connection::Server(server)) => server.server_name().map(str::to_owned),
            _ if !inner.hostname.is_empty() => Some(inner.hostname.clone()),
            _ => None,
        }
    }

    /// Whether the layer runs the server side of the session.
    pub fn is_server(&self) -> bool {
        self.inner.lock().unwrap().role == Some(Role::Server)
    }

    /// The peer's certificate in DER, once the handshake presented one.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .conn
            .as_ref()
            .and_then(|conn| conn.peer_certificates())
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    /// An opaque blob enabling session resumption on the next connection,
    /// to pass back into the handshake entry points.
    pub fn get_session_parameters(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(SESSION_BLOB_MAGIC);
        blob.push(SESSION_BLOB_VERSION);
        match inner.role {
            Some(Role::Client) => {
                blob.push(0);
                blob.extend_from_slice(&inner.resumption_key.unwrap_or(0).to_be_bytes());
            }
            Some(Role::Server) => {
                blob.push(1);
                let key = inner.ticket_key.unwrap_or([0; TICKET_KEY_LEN]);
                blob.extend_from_slice(&(key.len() as u32).to_be_bytes());
                blob.extend_from_slice(&key);
            }
            None => return Vec::new(),
        }
        blob
    }

    /// If running as server with TLS 1.3, requests a new session ticket.
    ///
    /// Never returns `WouldBlock`; a no-op for other TLS versions and
    /// `EINVAL` when not running as server. Ticket emission itself is
    /// handled by the engine behind any pending data.
    pub fn new_session_ticket(&self) -> io::Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.role != Some(Role::Server) {
            return Err(io::Error::from_raw_os_error(errc::EINVAL));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Internals

    fn lower_not_ready(&self, err: &io::Error) -> bool {
        // Handshakes may be started before the lower layer finished
        // connecting; treat that as "try again after the connection event".
        err.raw_os_error() == Some(errc::ENOTCONN)
            && matches!(
                self.base.next().state(),
                SocketState::None | SocketState::Connecting
            )
    }

    /// Drives the handshake: flushes the preamble, then services engine
    /// reads and writes against the next layer until the handshake blocks
    /// or completes.
    fn continue_handshake(&self, inner: &mut TlsInner) -> io::Result<()> {
        if inner.verification_pending {
            return Ok(());
        }

        while !inner.preamble.is_empty() {
            match self.base.next().write(inner.preamble.get()) {
                Ok(0) => {
                    self.failure_locked(inner, errc::ECONNABORTED, true);
                    return Err(econnaborted());
                }
                Ok(n) => inner.preamble.consume(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if self.lower_not_ready(&err) => return Ok(()),
                Err(err) => {
                    let code = raw_code(&err);
                    self.failure_locked(inner, code, true);
                    return Err(err);
                }
            }
        }

        loop {
            let Some(conn) = inner.conn.as_mut() else {
                return Ok(());
            };

            if conn.wants_write() {
                match conn.write_tls(&mut NextIo::new(self.base.next())) {
                    Ok(_) => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) if self.lower_not_ready(&err) => return Ok(()),
                    Err(err) => {
                        let code = raw_code(&err);
                        self.failure_locked(inner, code, true);
                        return Err(err);
                    }
                }
            }

            if !conn.is_handshaking() {
                break;
            }

            let mut lower = NextIo::new(self.base.next());
            match conn.read_tls(&mut lower) {
                Ok(0) => {
                    if !lower.saw_eof {
                        // Engine buffer full; nothing sensible to do until
                        // records were processed, which happens below on
                        // the next round.
                        return Ok(());
                    }
                    inner.socket_eof = true;
                    info!("remote closed the connection during the TLS handshake");
                    self.failure_locked(inner, errc::ECONNABORTED, true);
                    return Err(econnaborted());
                }
                Ok(_) => match conn.process_new_packets() {
                    Ok(io_state) => {
                        inner.pending_plaintext = io_state.plaintext_bytes_to_read();
                        inner.peer_closed = io_state.peer_has_closed();
                    }
                    Err(err) => {
                        info!("TLS handshake failed: {}", err);
                        // Best effort delivery of the fatal alert.
                        let _ = conn.write_tls(&mut NextIo::new(self.base.next()));
                        self.failure_locked(inner, errc::ECONNABORTED, true);
                        return Err(econnaborted());
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if self.lower_not_ready(&err) => return Ok(()),
                Err(err) => {
                    let code = raw_code(&err);
                    self.failure_locked(inner, code, true);
                    return Err(err);
                }
            }
        }

        self.handshake_complete(inner);
        Ok(())
    }

    fn handshake_complete(&self, inner: &mut TlsInner) {
        if self.resumed_session_locked(inner) {
            debug!("TLS session resumed");
        }

        match inner.role {
            Some(Role::Server) => self.finish_connected(inner),
            Some(Role::Client) => self.verify_client_certificate(inner),
            None => self.failure_locked(inner, errc::EINVAL, true),
        }
    }

    fn resumed_session_locked(&self, inner: &TlsInner) -> bool {
        inner
            .conn
            .as_ref()
            .and_then(|conn| conn.handshake_kind())
            .map(|kind| kind == HandshakeKind::Resumed)
            .unwrap_or(false)
    }

    fn verify_client_certificate(&self, inner: &mut TlsInner) {
        let captured = match inner.captured.as_ref().map(Arc::clone) {
            Some(captured) => captured,
            None => {
                self.failure_locked(inner, errc::EINVAL, true);
                return;
            }
        };
        let captured = captured.lock().unwrap();

        if captured.chain.is_empty() {
            warn!("peer presented no certificate");
            drop(captured);
            self.failure_locked(inner, errc::ECONNABORTED, true);
            return;
        }

        if let Some(pin) = inner.required_cert.clone() {
            let leaf_matches = captured
                .chain
                .first()
                .map(|leaf| leaf.as_ref() == pin.as_slice())
                .unwrap_or(false);
            drop(captured);
            if leaf_matches {
                self.finish_connected(inner);
            } else {
                warn!("peer certificate does not match the required certificate");
                self.failure_locked(inner, errc::EINVAL, true);
            }
            return;
        }

        if let Some(handler) = inner.verification_handler.clone() {
            let session_info = build_session_info(inner, &captured);
            drop(captured);
            inner.verification_pending = true;
            self.base.event_loop().send(
                &handler,
                Box::new(CertificateVerificationEvent::new((
                    self.base.source_id(),
                    session_info,
                ))),
            );
            return;
        }

        let trusted = captured.system_trust;
        drop(captured);
        if trusted {
            self.finish_connected(inner);
        } else {
            warn!(
                "certificate of {} not trusted by the system trust store",
                inner.hostname
            );
            self.failure_locked(inner, errc::ECONNABORTED, true);
        }
    }

    fn finish_connected(&self, inner: &mut TlsInner) {
        inner.state = SocketState::Connected;
        inner.app_waiting_write = false;
        self.base
            .forward_socket_event(SocketEventFlag::Connection, 0);
        if inner.pending_plaintext > 0 || inner.peer_closed || inner.socket_eof {
            inner.app_waiting_read = false;
            self.base.forward_socket_event(SocketEventFlag::Read, 0);
        } else {
            inner.app_waiting_read = true;
        }
    }

    /// Terminal error handling: uninitializes the session and emits the
    /// configured event, a connection event while connecting, a read event
    /// afterwards.
    fn failure_locked(&self, inner: &mut TlsInner, code: i32, send_event: bool) {
        debug!("TLS layer failure: {}", crate::net::error_string(code));
        let was_connecting =
            inner.state == SocketState::None || inner.state == SocketState::Connecting;
        inner.state = SocketState::Failed;
        inner.socket_error = code;
        inner.conn = None;
        inner.verification_pending = false;
        if send_event {
            if was_connecting {
                self.base
                    .forward_socket_event(SocketEventFlag::Connection, code);
            } else {
                self.base.forward_socket_event(SocketEventFlag::Read, code);
            }
        }
    }

    /// Reads TLS data from the next layer into the engine until it would
    /// block, observing EOF and lower failures.
    fn pump_reads(&self, inner: &mut TlsInner) {
        loop {
            if inner.socket_eof || inner.pending_plaintext >= MAX_BUFFERED_PLAINTEXT {
                return;
            }
            let Some(conn) = inner.conn.as_mut() else {
                return;
            };
            let mut lower = NextIo::new(self.base.next());
            match conn.read_tls(&mut lower) {
                Ok(0) => {
                    if lower.saw_eof {
                        inner.socket_eof = true;
                    }
                    return;
                }
                Ok(_) => match conn.process_new_packets() {
                    Ok(io_state) => {
                        inner.pending_plaintext = io_state.plaintext_bytes_to_read();
                        inner.peer_closed = io_state.peer_has_closed();
                    }
                    Err(err) => {
                        info!("TLS record processing failed: {}", err);
                        let _ = conn.write_tls(&mut NextIo::new(self.base.next()));
                        self.failure_locked(inner, errc::ECONNABORTED, true);
                        return;
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    let code = raw_code(&err);
                    self.failure_locked(inner, code, true);
                    return;
                }
            }
        }
    }

    /// Flushes buffered TLS records to the next layer. Returns whether the
    /// engine's send buffer drained completely.
    fn flush_writes(&self, inner: &mut TlsInner) -> io::Result<bool> {
        loop {
            let Some(conn) = inner.conn.as_mut() else {
                return Ok(true);
            };
            if !conn.wants_write() {
                return Ok(true);
            }
            match conn.write_tls(&mut NextIo::new(self.base.next())) {
                Ok(0) => return Ok(false),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => {
                    let code = raw_code(&err);
                    self.failure_locked(inner, code, true);
                    return Err(err);
                }
            }
        }
    }

    fn continue_shutdown(&self, inner: &mut TlsInner) -> io::Result<()> {
        // Queued data and tickets drain before the closure alert.
        if !self.flush_writes(inner)? {
            inner.app_waiting_write = true;
            return Err(eagain());
        }

        if !inner.closure_alert_sent {
            if let Some(conn) = inner.conn.as_mut() {
                conn.send_close_notify();
            }
            inner.closure_alert_sent = true;
        }
        if !self.flush_writes(inner)? {
            inner.app_waiting_write = true;
            return Err(eagain());
        }

        match self.base.next().shutdown() {
            Ok(()) => {
                inner.state = SocketState::ShutDown;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                inner.app_waiting_write = true;
                Err(eagain())
            }
            Err(err) => {
                let code = raw_code(&err);
                self.failure_locked(inner, code, true);
                Err(err)
            }
        }
    }

    fn on_read_event(&self, inner: &mut TlsInner) {
        match inner.state {
            SocketState::Connecting => {
                let _ = self.continue_handshake(inner);
            }
            SocketState::Connected | SocketState::ShuttingDown | SocketState::ShutDown => {
                self.pump_reads(inner);
                if inner.state == SocketState::Failed {
                    return;
                }
                if inner.app_waiting_read
                    && (inner.pending_plaintext > 0 || inner.peer_closed || inner.socket_eof)
                {
                    inner.app_waiting_read = false;
                    self.base.forward_socket_event(SocketEventFlag::Read, 0);
                }
            }
            _ => {}
        }
    }

    fn on_write_event(&self, inner: &mut TlsInner) {
        match inner.state {
            SocketState::Connecting => {
                let _ = self.continue_handshake(inner);
            }
            SocketState::ShuttingDown => match self.continue_shutdown(inner) {
                Ok(()) => {
                    if std::mem::take(&mut inner.app_waiting_write) {
                        self.base.forward_socket_event(SocketEventFlag::Write, 0);
                    }
                }
                Err(_) => {}
            },
            SocketState::Connected => {
                if self.flush_writes(inner).unwrap_or(false)
                    && std::mem::take(&mut inner.app_waiting_write)
                {
                    self.base.forward_socket_event(SocketEventFlag::Write, 0);
                }
            }
            _ => {}
        }
    }

    fn on_socket_error(&self, inner: &mut TlsInner, code: i32) {
        info!(
            "lower layer failed: {}",
            crate::net::error_string(code)
        );
        self.failure_locked(inner, code, true);
    }
}

impl EventHandler for TlsLayer {
    fn on_event(&self, event: &dyn Event) {
        if let Some(&(_, flag, error)) = as_socket_event(event) {
            let mut inner = self.inner.lock().unwrap();
            match flag {
                SocketEventFlag::Read => {
                    if error != 0 {
                        self.on_socket_error(&mut inner, error);
                    } else {
                        self.on_read_event(&mut inner);
                    }
                }
                SocketEventFlag::Write => {
                    if error != 0 {
                        self.on_socket_error(&mut inner, error);
                    } else {
                        self.on_write_event(&mut inner);
                    }
                }
                SocketEventFlag::Connection => {
                    if error != 0 {
                        if inner.state != SocketState::None {
                            inner.state = SocketState::Failed;
                            inner.socket_error = error;
                        }
                        self.base
                            .forward_socket_event(SocketEventFlag::Connection, error);
                    } else if inner.state == SocketState::Connecting {
                        // The application's connection event is the
                        // handshake completion.
                        let _ = self.continue_handshake(&mut inner);
                    } else {
                        self.base
                            .forward_socket_event(SocketEventFlag::Connection, 0);
                    }
                }
                SocketEventFlag::ConnectionNext => {
                    self.base
                        .forward_socket_event(SocketEventFlag::ConnectionNext, error);
                }
            }
        } else if let Some((_, address)) = as_host_address_event(event) {
            self.base.forward_host_address_event(address.clone());
        }
    }
}

impl SocketInterface for TlsLayer {
    fn connect(&self, host: &str, port: u16, family: AddressFamily) -> io::Result<()> {
        self.base.next().connect(host, port, family)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SocketState::Connected | SocketState::ShuttingDown | SocketState::ShutDown => {}
            SocketState::Failed => {
                let code = if inner.socket_error != 0 {
                    inner.socket_error
                } else {
                    errc::ECONNABORTED
                };
                return Err(io::Error::from_raw_os_error(code));
            }
            _ => return Err(enotconn()),
        }

        self.pump_reads(&mut inner);
        if inner.state == SocketState::Failed {
            return Err(io::Error::from_raw_os_error(inner.socket_error));
        }

        let Some(conn) = inner.conn.as_mut() else {
            return Err(enotconn());
        };
        match conn.reader().read(buf) {
            Ok(n) => {
                inner.pending_plaintext = inner.pending_plaintext.saturating_sub(n);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                inner.pending_plaintext = 0;
                if inner.socket_eof {
                    self.log_premature_eof(&inner);
                    Err(econnaborted())
                } else {
                    inner.app_waiting_read = true;
                    Err(eagain())
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.log_premature_eof(&inner);
                Err(econnaborted())
            }
            Err(err) => Err(err),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SocketState::Connected => {}
            SocketState::ShuttingDown | SocketState::ShutDown => {
                return Err(io::Error::from_raw_os_error(errc::EINVAL));
            }
            SocketState::Failed => {
                return Err(io::Error::from_raw_os_error(inner.socket_error));
            }
            _ => return Err(enotconn()),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Drain what the engine accepted earlier but could not flush; until
        // that is gone no further data is taken.
        if !self.flush_writes(&mut inner)? {
            inner.app_waiting_write = true;
            return Err(eagain());
        }

        let Some(conn) = inner.conn.as_mut() else {
            return Err(enotconn());
        };
        let chunk = buf.len().min(MAX_TLS_RECORD);
        let written = conn.writer().write(&buf[..chunk])?;

        let _ = self.flush_writes(&mut inner)?;
        Ok(written)
    }

    fn shutdown(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SocketState::Connected | SocketState::ShuttingDown => {
                inner.state = SocketState::ShuttingDown;
                self.continue_shutdown(&mut inner)
            }
            SocketState::ShutDown => Ok(()),
            _ => Err(enotconn()),
        }
    }

    /// Checks that the secure channel EOF is backed by an EOF of all lower
    /// layers.
    ///
    /// Fails with `ECONNABORTED` while decrypted data is still pending,
    /// since discarding it would truncate the stream.
    fn shutdown_read(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.pump_reads(&mut inner);
        if inner.state == SocketState::Failed {
            return Err(io::Error::from_raw_os_error(inner.socket_error));
        }
        if inner.pending_plaintext > 0 {
            return Err(econnaborted());
        }
        if inner.peer_closed {
            return self.base.next().shutdown_read();
        }
        if inner.socket_eof {
            return Err(econnaborted());
        }
        inner.app_waiting_read = true;
        Err(eagain())
    }

    fn state(&self) -> SocketState {
        self.inner.lock().unwrap().state
    }

    fn set_event_handler(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        retrigger_block: SocketEventFlags,
    ) {
        let old = self.base.replace_handler(handler.clone());
        if let Some(old) = &old {
            change_socket_event_handler(
                self.base.event_loop(),
                old,
                handler.as_ref(),
                self.base.source_id(),
                retrigger_block,
            );
        }
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

impl TlsLayer {
    fn log_premature_eof(&self, inner: &TlsInner) {
        let suppress = inner
            .unexpected_eof_cb
            .as_ref()
            .map(|cb| !cb())
            .unwrap_or(false);
        if suppress {
            debug!("connection closed without closure alert");
        } else {
            warn!("connection closed without closure alert");
        }
    }
}

impl Drop for TlsLayer {
    fn drop(&mut self) {
        self.base
            .next()
            .set_event_handler(None, SocketEventFlags::EMPTY);
    }
}

impl fmt::Debug for TlsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("TlsLayer")
            .field("state", &inner.state)
            .field("role", &inner.role)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn normalize_certificate(data: &[u8]) -> io::Result<Vec<u8>> {
    if data.starts_with(b"-----BEGIN") {
        let mut reader = io::BufReader::new(data);
        let mut certs = rustls_pemfile::certs(&mut reader);
        match certs.next() {
            Some(Ok(cert)) => Ok(cert.as_ref().to_vec()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no certificate found",
            )),
        }
    } else {
        Ok(data.to_vec())
    }
}

fn selected_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> io::Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let min = if min < TlsVersion::V1_2 {
        debug!("TLS versions below 1.2 are unsupported, clamping the minimum");
        TlsVersion::V1_2
    } else {
        min
    };

    let mut versions = Vec::new();
    if min <= TlsVersion::V1_2 && TlsVersion::V1_2 <= max {
        versions.push(&rustls::version::TLS12);
    }
    if min <= TlsVersion::V1_3 && TlsVersion::V1_3 <= max {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        return Err(io::Error::from_raw_os_error(errc::EINVAL));
    }
    Ok(versions)
}

fn parse_client_session_blob(blob: &[u8]) -> Option<u64> {
    if blob.len() != 4 + 1 + 1 + 8 || &blob[..4] != SESSION_BLOB_MAGIC {
        return None;
    }
    if blob[4] != SESSION_BLOB_VERSION || blob[5] != 0 {
        return None;
    }
    let mut key = [0u8; 8];
    key.copy_from_slice(&blob[6..14]);
    Some(u64::from_be_bytes(key))
}

fn parse_server_session_blob(blob: &[u8]) -> Option<[u8; TICKET_KEY_LEN]> {
    if blob.len() < 4 + 1 + 1 + 4 || &blob[..4] != SESSION_BLOB_MAGIC {
        return None;
    }
    if blob[4] != SESSION_BLOB_VERSION || blob[5] != 1 {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&blob[6..10]);
    let len = u32::from_be_bytes(len) as usize;
    if len != TICKET_KEY_LEN || blob.len() != 10 + len {
        return None;
    }
    let mut key = [0u8; TICKET_KEY_LEN];
    key.copy_from_slice(&blob[10..]);
    Some(key)
}

fn protocol_string(version: Option<ProtocolVersion>) -> String {
    match version {
        Some(ProtocolVersion::TLSv1_2) => "TLS1.2".to_owned(),
        Some(ProtocolVersion::TLSv1_3) => "TLS1.3".to_owned(),
        Some(other) => format!("{:?}", other),
        None => "unknown".to_owned(),
    }
}

/// `((cipher, mac), key_exchange)` of the negotiated suite.
fn suite_info(inner: &TlsInner) -> ((String, String), String) {
    let suite = inner
        .conn
        .as_ref()
        .and_then(|conn| conn.negotiated_cipher_suite());
    let Some(suite) = suite else {
        return (("unknown".to_owned(), "unknown".to_owned()), "unknown".to_owned());
    };

    let (cipher, mac, kex) = match suite.suite() {
        CipherSuite::TLS13_AES_128_GCM_SHA256 => ("AES-128-GCM", "AEAD", "ECDHE"),
        CipherSuite::TLS13_AES_256_GCM_SHA384 => ("AES-256-GCM", "AEAD", "ECDHE"),
        CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => ("CHACHA20-POLY1305", "AEAD", "ECDHE"),
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
            ("AES-128-GCM", "AEAD", "ECDHE-ECDSA")
        }
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
            ("AES-256-GCM", "AEAD", "ECDHE-ECDSA")
        }
        CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
            ("CHACHA20-POLY1305", "AEAD", "ECDHE-ECDSA")
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => {
            ("AES-128-GCM", "AEAD", "ECDHE-RSA")
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => {
            ("AES-256-GCM", "AEAD", "ECDHE-RSA")
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            ("CHACHA20-POLY1305", "AEAD", "ECDHE-RSA")
        }
        other => {
            return (
                (format!("{:?}", other), "AEAD".to_owned()),
                "unknown".to_owned(),
            )
        }
    };
    ((cipher.to_owned(), mac.to_owned()), kex.to_owned())
}

/// Flags the negotiated algorithms that are in the known-weak sets.
fn compute_algorithm_warnings(inner: &TlsInner) -> u32 {
    let mut warnings = 0;

    let version = inner.conn.as_ref().and_then(|conn| conn.protocol_version());
    match version {
        Some(ProtocolVersion::TLSv1_2) | Some(ProtocolVersion::TLSv1_3) => {}
        _ => warnings |= algorithm_warnings::TLS_VER,
    }

    let ((cipher, mac), kex) = suite_info(inner);
    const WEAK_CIPHERS: [&str; 7] = [
        "unknown",
        "NULL",
        "RC4-128",
        "3DES-CBC",
        "RC4-40",
        "RC2-40-CBC",
        "DES-CBC",
    ];
    if WEAK_CIPHERS.contains(&cipher.as_str()) {
        warnings |= algorithm_warnings::CIPHER;
    }
    const WEAK_MACS: [&str; 5] = ["unknown", "NULL", "MD5", "MD2", "UMAC-96"];
    if WEAK_MACS.contains(&mac.as_str()) {
        warnings |= algorithm_warnings::MAC;
    }
    const WEAK_KEX: [&str; 4] = ["unknown", "ANON-DH", "RSA-export", "ANON-ECDH"];
    if WEAK_KEX.contains(&kex.as_str()) {
        warnings |= algorithm_warnings::KEX;
    }

    warnings
}

fn build_session_info(inner: &TlsInner, captured: &Captured) -> TlsSessionInfo {
    let peer_certificates: Vec<CertificateInfo> = captured
        .chain
        .iter()
        .filter_map(|der| info::parse_certificate(der.as_ref()).ok())
        .collect();

    // With system trust established, the presented chain is the trust
    // chain.
    let system_trust_chain = if captured.system_trust {
        peer_certificates.clone()
    } else {
        Vec::new()
    };

    let ((session_cipher, session_mac), key_exchange) = suite_info(inner);
    TlsSessionInfo {
        host: inner.hostname.clone(),
        port: inner.port,
        protocol: protocol_string(
            inner.conn.as_ref().and_then(|conn| conn.protocol_version()),
        ),
        key_exchange,
        session_cipher,
        session_mac,
        algorithm_warnings: compute_algorithm_warnings(inner),
        peer_certificates,
        system_trust_chain,
        hostname_mismatch: captured.hostname_mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_blob_roundtrip() {
        let mut client_blob = Vec::new();
        client_blob.extend_from_slice(SESSION_BLOB_MAGIC);
        client_blob.push(SESSION_BLOB_VERSION);
        client_blob.push(0);
        client_blob.extend_from_slice(&0x1122334455667788u64.to_be_bytes());
        assert_eq!(
            parse_client_session_blob(&client_blob),
            Some(0x1122334455667788)
        );
        assert!(parse_server_session_blob(&client_blob).is_none());

        let key = [7u8; TICKET_KEY_LEN];
        let mut server_blob = Vec::new();
        server_blob.extend_from_slice(SESSION_BLOB_MAGIC);
        server_blob.push(SESSION_BLOB_VERSION);
        server_blob.push(1);
        server_blob.extend_from_slice(&(TICKET_KEY_LEN as u32).to_be_bytes());
        server_blob.extend_from_slice(&key);
        assert_eq!(parse_server_session_blob(&server_blob), Some(key));
        assert!(parse_client_session_blob(&server_blob).is_none());

        // Garbage is rejected, not misparsed.
        assert!(parse_client_session_blob(b"bogus").is_none());
        assert!(parse_server_session_blob(&[]).is_none());
    }

    #[test]
    fn version_selection() {
        assert_eq!(
            selected_versions(TlsVersion::V1_0, TlsVersion::V1_3)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            selected_versions(TlsVersion::V1_3, TlsVersion::V1_3)
                .unwrap()
                .len(),
            1
        );
        assert!(selected_versions(TlsVersion::V1_3, TlsVersion::V1_2).is_err());
    }
}
