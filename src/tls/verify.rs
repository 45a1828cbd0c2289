//! Certificate verification plumbing for the client side of the TLS layer.
//!
//! The verifier installed into the TLS engine records the presented chain
//! and the system-trust outcome while the handshake runs; the trust
//! decision itself is made by the layer afterwards, either against a pinned
//! certificate, solely on system trust, or by the application through a
//! certificate verification event. The only check applied unconditionally
//! is the authority blacklist, which aborts the handshake outright.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, SignatureScheme};

use crate::tls::info::chain_is_blacklisted;
use crate::tls::trust::SystemTrustStore;

/// What the verifier observed during the handshake.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    /// The chain as presented by the peer, leaf first.
    pub(crate) chain: Vec<CertificateDer<'static>>,
    /// Whether validation against the system trust store succeeded,
    /// including the hostname binding.
    pub(crate) system_trust: bool,
    /// Whether validation failed only on the hostname.
    pub(crate) hostname_mismatch: bool,
}

#[derive(Debug)]
pub(crate) struct CapturingVerifier {
    system: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    captured: Arc<Mutex<Captured>>,
}

impl CapturingVerifier {
    pub(crate) fn new(trust_store: Option<&SystemTrustStore>) -> CapturingVerifier {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

        let system = trust_store.and_then(|store| {
            let roots = store.roots();
            if roots.is_empty() {
                return None;
            }
            match WebPkiServerVerifier::builder(roots).build() {
                Ok(verifier) => Some(verifier),
                Err(err) => {
                    warn!("cannot build system trust verifier: {}", err);
                    None
                }
            }
        });

        CapturingVerifier {
            system,
            provider,
            captured: Arc::new(Mutex::new(Captured::default())),
        }
    }

    pub(crate) fn captured(&self) -> Arc<Mutex<Captured>> {
        Arc::clone(&self.captured)
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let mut captured = self.captured.lock().unwrap();
        captured.chain = std::iter::once(end_entity.clone().into_owned())
            .chain(intermediates.iter().map(|c| c.clone().into_owned()))
            .collect();

        if chain_is_blacklisted(&captured.chain) {
            warn!("peer certificate chain contains a blacklisted authority");
            return Err(Error::General(
                "certificate issued by a blacklisted authority".to_owned(),
            ));
        }

        // The hostname binding only makes sense for actual hostnames; with
        // a bare IP literal the system trust evaluation is skipped.
        let is_ip = matches!(server_name, ServerName::IpAddress(_));
        if let (Some(system), false) = (&self.system, is_ip) {
            match system.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(_) => captured.system_trust = true,
                Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                    captured.hostname_mismatch = true;
                }
                Err(Error::InvalidCertificate(
                    CertificateError::NotValidForNameContext { .. },
                )) => {
                    captured.hostname_mismatch = true;
                }
                Err(err) => {
                    debug!("system trust validation failed: {:?}", err);
                }
            }
        }

        // Trust policy is applied by the layer after the handshake.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
