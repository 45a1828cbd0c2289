//! Information about TLS sessions and the certificates used by them.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha1::Digest;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

/// Warnings about old algorithms which are considered weak.
pub mod algorithm_warnings {
    /// The negotiated TLS version is obsolete.
    pub const TLS_VER: u32 = 1;
    /// The negotiated cipher is weak.
    pub const CIPHER: u32 = 2;
    /// The negotiated MAC is weak.
    pub const MAC: u32 = 4;
    /// The negotiated key exchange is weak.
    pub const KEX: u32 = 8;
}

/// A subject name of a certificate, typically a DNS hostname.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubjectName {
    /// The name.
    pub name: String,
    /// Whether the name is a DNS hostname (as opposed to an email address
    /// or IP literal).
    pub is_dns: bool,
}

/// All relevant information of an X.509 certificate as used by TLS.
#[derive(Clone, Debug)]
pub struct CertificateInfo {
    raw: Vec<u8>,
    activation_time: SystemTime,
    expiration_time: SystemTime,
    serial: String,
    pubkey_algorithm: String,
    pubkey_bits: u32,
    signature_algorithm: String,
    fingerprint_sha256: String,
    fingerprint_sha1: String,
    issuer: String,
    subject: String,
    alt_subject_names: Vec<SubjectName>,
    self_signed: bool,
}

impl CertificateInfo {
    /// The raw, DER-encoded certificate.
    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    /// Start of the validity period.
    pub fn activation_time(&self) -> SystemTime {
        self.activation_time
    }

    /// End of the validity period.
    pub fn expiration_time(&self) -> SystemTime {
        self.expiration_time
    }

    /// The serial number as lowercase hex bytes with `:` separators. May be
    /// empty.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The public key algorithm used by the certificate.
    pub fn pubkey_algorithm(&self) -> &str {
        &self.pubkey_algorithm
    }

    /// The number of bits of the public key.
    pub fn pubkey_bits(&self) -> u32 {
        self.pubkey_bits
    }

    /// The algorithm used for signing, typically the public key algorithm
    /// combined with a hash.
    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    /// SHA-256 fingerprint, same hex format as the serial.
    pub fn fingerprint_sha256(&self) -> &str {
        &self.fingerprint_sha256
    }

    /// SHA-1 fingerprint, same hex format as the serial.
    pub fn fingerprint_sha1(&self) -> &str {
        &self.fingerprint_sha1
    }

    /// The issuer as an RFC 4514 distinguished name.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The subject as an RFC 4514 distinguished name.
    ///
    /// Never compare the CN field against a hostname, that is what the
    /// subject alternative names are for.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The subject alternative names, usually hostnames.
    pub fn alt_subject_names(&self) -> &[SubjectName] {
        &self.alt_subject_names
    }

    /// Whether the certificate is self-signed. Meaningful for the last
    /// element of a chain.
    pub fn self_signed(&self) -> bool {
        self.self_signed
    }
}

/// Renders bytes as lowercase hex pairs joined by `:`.
fn hex_sep(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn asn1_time(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.5" => "RSA-SHA1".to_owned(),
        "1.2.840.113549.1.1.11" => "RSA-SHA256".to_owned(),
        "1.2.840.113549.1.1.12" => "RSA-SHA384".to_owned(),
        "1.2.840.113549.1.1.13" => "RSA-SHA512".to_owned(),
        "1.2.840.113549.1.1.10" => "RSA-PSS".to_owned(),
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256".to_owned(),
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384".to_owned(),
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512".to_owned(),
        "1.3.101.112" => "EdDSA-Ed25519".to_owned(),
        other => other.to_owned(),
    }
}

/// Extracts the information of a single DER certificate.
pub fn parse_certificate(der: &[u8]) -> io::Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;

    let validity = cert.validity();
    let activation_time = asn1_time(validity.not_before.timestamp());
    let expiration_time = asn1_time(validity.not_after.timestamp());
    if expiration_time < activation_time {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "certificate expires before its activation",
        ));
    }

    let (pubkey_algorithm, pubkey_bits) = match cert.public_key().parsed() {
        Ok(key) => {
            let name = match &key {
                x509_parser::public_key::PublicKey::RSA(_) => "RSA",
                x509_parser::public_key::PublicKey::EC(_) => "ECDSA",
                x509_parser::public_key::PublicKey::DSA(_) => "DSA",
                _ => "Unknown",
            };
            (name.to_owned(), key.key_size() as u32)
        }
        Err(_) => ("Unknown".to_owned(), 0),
    };

    let mut alt_subject_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(name) => alt_subject_names.push(SubjectName {
                    name: (*name).to_owned(),
                    is_dns: true,
                }),
                GeneralName::RFC822Name(name) => alt_subject_names.push(SubjectName {
                    name: (*name).to_owned(),
                    is_dns: false,
                }),
                GeneralName::IPAddress(bytes) => {
                    let rendered = match bytes.len() {
                        4 => {
                            let mut octets = [0u8; 4];
                            octets.copy_from_slice(bytes);
                            Some(std::net::Ipv4Addr::from(octets).to_string())
                        }
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(bytes);
                            Some(std::net::Ipv6Addr::from(octets).to_string())
                        }
                        _ => None,
                    };
                    if let Some(name) = rendered {
                        alt_subject_names.push(SubjectName {
                            name,
                            is_dns: false,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    let self_signed = subject == issuer;

    Ok(CertificateInfo {
        activation_time,
        expiration_time,
        serial: hex_sep(cert.raw_serial()),
        pubkey_algorithm,
        pubkey_bits,
        signature_algorithm: signature_algorithm_name(
            &cert.signature_algorithm.algorithm.to_id_string(),
        ),
        fingerprint_sha256: hex_sep(&sha2::Sha256::digest(der)),
        fingerprint_sha1: hex_sep(&sha1::Sha1::digest(der)),
        issuer,
        subject,
        alt_subject_names,
        self_signed,
        raw: der.to_vec(),
    })
}

/// Gets the certificate information for all certificates in `data`.
///
/// With the sort flag a chain is built with certificate `i` signed by
/// `i + 1`; if that fails, an error is returned. Without it, certificates
/// come back in input order.
pub fn load_certificates(data: &[u8], pem: bool, sort: bool) -> io::Result<Vec<CertificateInfo>> {
    let ders: Vec<Vec<u8>> = if pem {
        let mut reader = io::BufReader::new(data);
        rustls_pemfile::certs(&mut reader)
            .map(|cert| cert.map(|c| c.as_ref().to_vec()))
            .collect::<Result<_, _>>()?
    } else {
        vec![data.to_vec()]
    };

    if ders.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }

    let mut infos = ders
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<io::Result<Vec<_>>>()?;

    if sort && infos.len() > 1 {
        infos = sort_chain(infos)?;
    }
    Ok(infos)
}

// Orders certificates leaf-first so that each one is signed by its
// successor.
fn sort_chain(mut infos: Vec<CertificateInfo>) -> io::Result<Vec<CertificateInfo>> {
    let chain_error = || io::Error::new(io::ErrorKind::InvalidData, "certificates do not chain");

    // The leaf is the one that issued nobody else.
    let leaf = infos
        .iter()
        .position(|cand| !infos.iter().any(|other| {
            other.subject != cand.subject && other.issuer == cand.subject
        }))
        .ok_or_else(chain_error)?;

    let mut sorted = vec![infos.swap_remove(leaf)];
    while !infos.is_empty() {
        let issuer = &sorted.last().unwrap().issuer;
        let next = infos
            .iter()
            .position(|cand| &cand.subject == issuer)
            .ok_or_else(chain_error)?;
        sorted.push(infos.swap_remove(next));
    }
    Ok(sorted)
}

/// Whether any certificate in the chain is issued by a blacklisted
/// authority. Known state-level interception roots are rejected without
/// recourse.
pub(crate) fn chain_is_blacklisted(chain: &[impl AsRef<[u8]>]) -> bool {
    // Nation-wide MITM in Kazakhstan.
    const BAD_AUTHORITY_KEY_IDS: [&[u8]; 1] = [&[
        0xf4, 0x94, 0xbf, 0xde, 0x50, 0xb6, 0xdb, 0x6b, 0x24, 0x3d, 0x9e, 0xf7, 0xbe, 0x3a, 0xae,
        0x36, 0xd7, 0xfb, 0x0e, 0x05,
    ]];

    for der in chain {
        let cert = match X509Certificate::from_der(der.as_ref()) {
            Ok((_, cert)) => cert,
            Err(_) => continue,
        };
        for ext in cert.extensions() {
            if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
                if let Some(key_id) = &aki.key_identifier {
                    if BAD_AUTHORITY_KEY_IDS.iter().any(|bad| *bad == key_id.0) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Information about a TLS session: the negotiated algorithms and details
/// on the certificates sent by the server.
#[derive(Clone)]
pub struct TlsSessionInfo {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) protocol: String,
    pub(crate) key_exchange: String,
    pub(crate) session_cipher: String,
    pub(crate) session_mac: String,
    pub(crate) algorithm_warnings: u32,
    pub(crate) peer_certificates: Vec<CertificateInfo>,
    pub(crate) system_trust_chain: Vec<CertificateInfo>,
    pub(crate) hostname_mismatch: bool,
}

impl TlsSessionInfo {
    /// The server's hostname used to connect.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The server's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// TLS version.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Key exchange algorithm.
    pub fn key_exchange(&self) -> &str {
        &self.key_exchange
    }

    /// The symmetric algorithm encrypting the exchanged application data.
    pub fn session_cipher(&self) -> &str {
        &self.session_cipher
    }

    /// The MAC integrity-protecting the exchanged application data.
    pub fn session_mac(&self) -> &str {
        &self.session_mac
    }

    /// Bitmask of [`algorithm_warnings`] about weak negotiated algorithms.
    pub fn algorithm_warnings(&self) -> u32 {
        self.algorithm_warnings
    }

    /// The certificate chain to evaluate, leaf first.
    ///
    /// With [`TlsSessionInfo::system_trust`] set this is the chain to the
    /// actual trust anchor, otherwise the chain as received from the peer.
    pub fn certificates(&self) -> &[CertificateInfo] {
        if self.system_trust_chain.is_empty() {
            &self.peer_certificates
        } else {
            &self.system_trust_chain
        }
    }

    /// The certificate chain as sent by the peer, leaf first. May be
    /// partial, i.e. not ending at a self-signed certificate.
    pub fn peer_certificates(&self) -> &[CertificateInfo] {
        &self.peer_certificates
    }

    /// Whether the chain is trusted by the operating system's trust store.
    pub fn system_trust(&self) -> bool {
        !self.system_trust_chain.is_empty()
    }

    /// Whether the requested hostname mismatches the certificate's subject
    /// alternative names.
    pub fn mismatched_hostname(&self) -> bool {
        self.hostname_mismatch
    }
}

impl fmt::Debug for TlsSessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSessionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("system_trust", &self.system_trust())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formatting() {
        assert_eq!(hex_sep(&[0xde, 0xad, 0x01]), "de:ad:01");
        assert_eq!(hex_sep(&[]), "");
    }

    #[test]
    fn selfsigned_roundtrip() {
        let hostnames = vec!["node.example.net".to_owned(), "192.0.2.7".to_owned()];
        let (_, cert_pem) = crate::tls::generate_selfsigned_certificate(
            "",
            "CN=node.example.net,O=Example,C=DE",
            &hostnames,
        )
        .unwrap();

        let chain = load_certificates(cert_pem.as_bytes(), true, true).unwrap();
        assert_eq!(chain.len(), 1);
        let info = &chain[0];

        assert!(info.self_signed());
        assert!(info.activation_time() < SystemTime::now());
        let validity = info
            .expiration_time()
            .duration_since(info.activation_time())
            .unwrap();
        assert!(validity >= Duration::from_secs(365 * 24 * 60 * 60));
        assert!(validity <= Duration::from_secs(367 * 24 * 60 * 60));

        assert!(info.subject().contains("node.example.net"));
        assert_eq!(info.pubkey_algorithm(), "ECDSA");
        assert_eq!(info.pubkey_bits(), 256);
        assert_eq!(info.signature_algorithm(), "ECDSA-SHA256");

        let names: Vec<&str> = info
            .alt_subject_names()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert!(names.contains(&"node.example.net"));
        assert!(names.contains(&"192.0.2.7"));
        assert_eq!(
            info.alt_subject_names()
                .iter()
                .find(|n| n.name == "node.example.net")
                .unwrap()
                .is_dns,
            true
        );

        // Fingerprints are hex with separators.
        assert_eq!(info.fingerprint_sha256().len(), 32 * 3 - 1);
        assert_eq!(info.fingerprint_sha1().len(), 20 * 3 - 1);
    }
}
