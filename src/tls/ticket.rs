//! Session-ticket sealing with a stable key.
//!
//! The server's resumption blob carries the ticket key, so tickets issued
//! before a restart stay decryptable afterwards. Tickets are sealed with
//! AES-256-CTR and authenticated with HMAC-SHA-256 (encrypt-then-MAC).

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) const TICKET_KEY_LEN: usize = 64;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Produces and opens session tickets under a fixed 64-byte key: the first
/// half keys the cipher, the second half the MAC.
pub(crate) struct StaticTicketer {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl StaticTicketer {
    pub(crate) fn new(key: &[u8; TICKET_KEY_LEN]) -> StaticTicketer {
        let mut cipher_key = [0; 32];
        let mut mac_key = [0; 32];
        cipher_key.copy_from_slice(&key[..32]);
        mac_key.copy_from_slice(&key[32..]);
        StaticTicketer { cipher_key, mac_key }
    }

    pub(crate) fn generate_key() -> [u8; TICKET_KEY_LEN] {
        let mut key = [0; TICKET_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn mac(&self, data: &[u8]) -> Option<[u8; TAG_LEN]> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).ok()?;
        mac.update(data);
        let mut tag = [0; TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Some(tag)
    }
}

impl rustls::server::ProducesTickets for StaticTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        // 6 hours, the conventional ticket lifetime.
        6 * 60 * 60
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut nonce = [0; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(NONCE_LEN + plain.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plain);
        let mut cipher = Aes256Ctr::new(&self.cipher_key.into(), &nonce.into());
        cipher.apply_keystream(&mut out[NONCE_LEN..]);

        let tag = self.mac(&out)?;
        out.extend_from_slice(&tag);
        Some(out)
    }

    fn decrypt(&self, cipher_text: &[u8]) -> Option<Vec<u8>> {
        if cipher_text.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (body, tag) = cipher_text.split_at(cipher_text.len() - TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key).ok()?;
        mac.update(body);
        mac.verify_slice(tag).ok()?;

        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&body[..NONCE_LEN]);
        let mut plain = body[NONCE_LEN..].to_vec();
        let mut cipher = Aes256Ctr::new(&self.cipher_key.into(), &nonce.into());
        cipher.apply_keystream(&mut plain);
        Some(plain)
    }
}

impl std::fmt::Debug for StaticTicketer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTicketer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::ProducesTickets;

    #[test]
    fn seal_and_open() {
        let key = StaticTicketer::generate_key();
        let ticketer = StaticTicketer::new(&key);

        let sealed = ticketer.encrypt(b"session state").unwrap();
        assert_ne!(&sealed[NONCE_LEN..sealed.len() - TAG_LEN], b"session state");
        assert_eq!(ticketer.decrypt(&sealed).unwrap(), b"session state");
    }

    #[test]
    fn tampered_tickets_fail() {
        let key = StaticTicketer::generate_key();
        let ticketer = StaticTicketer::new(&key);

        let mut sealed = ticketer.encrypt(b"session state").unwrap();
        let len = sealed.len();
        sealed[len / 2] ^= 1;
        assert!(ticketer.decrypt(&sealed).is_none());
    }

    #[test]
    fn key_survives_reconstruction() {
        let key = StaticTicketer::generate_key();
        let sealed = StaticTicketer::new(&key).encrypt(b"ticket").unwrap();

        // A ticketer rebuilt from the same key, as after a restart.
        let reopened = StaticTicketer::new(&key).decrypt(&sealed).unwrap();
        assert_eq!(reopened, b"ticket");
    }
}
