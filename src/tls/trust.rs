//! Access to the operating system's trust store.

use std::sync::{Arc, OnceLock};

use log::{debug, warn};
use rustls::RootCertStore;

/// A handle on the OS-native collection of root CAs.
///
/// The roots are loaded lazily on first use and shared between clones; the
/// TLS layer borrows them read-only while validating a server certificate
/// chain.
#[derive(Clone, Debug, Default)]
pub struct SystemTrustStore {
    roots: Arc<OnceLock<Arc<RootCertStore>>>,
}

impl SystemTrustStore {
    /// Creates a lease on the system trust store. Loading happens on first
    /// use.
    pub fn new() -> SystemTrustStore {
        SystemTrustStore::default()
    }

    /// The loaded root certificates. Empty if the platform store could not
    /// be read.
    pub(crate) fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(self.roots.get_or_init(|| {
            let mut store = RootCertStore::empty();
            let result = rustls_native_certs::load_native_certs();
            for err in &result.errors {
                warn!("error loading a system trust root: {}", err);
            }
            let mut added = 0;
            for cert in result.certs {
                if store.add(cert).is_ok() {
                    added += 1;
                }
            }
            debug!("loaded {} system trust roots", added);
            Arc::new(store)
        }))
    }

    /// Whether any usable root was found.
    pub fn is_usable(&self) -> bool {
        !self.roots().is_empty()
    }
}
