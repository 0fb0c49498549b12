//! Optional frame encryption.
//!
//! Payloads are sealed with ChaCha20-Poly1305 after compression. Each
//! direction uses its own key, derived from the pre-shared secret with
//! `blake3::derive_key`, and its own 64-bit nonce counter. The counter is
//! sent in clear in front of the ciphertext so frames can be opened in any
//! order (datagram transports reorder).
//!
//! ```text
//! counter: u64 BE (8) | ciphertext | tag (16)
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{DecodeError, RdxError};
use crate::wire::Side;

const HOST_TO_CLIENT: &str = "rdx 2026-10 host-to-client frame key";
const CLIENT_TO_HOST: &str = "rdx 2026-10 client-to-host frame key";

const COUNTER_SIZE: usize = 8;
const TAG_SIZE: usize = 16;

/// Bytes added to every sealed payload.
pub const SEAL_OVERHEAD: usize = COUNTER_SIZE + TAG_SIZE;

/// Derive the (outbound, inbound) halves for `side` from a shared secret.
pub fn derive(secret: &[u8], side: Side) -> (Sealer, Opener) {
    let h2c = blake3::derive_key(HOST_TO_CLIENT, secret);
    let c2h = blake3::derive_key(CLIENT_TO_HOST, secret);
    let (out_key, in_key) = match side {
        Side::Host => (h2c, c2h),
        Side::Client => (c2h, h2c),
    };
    (
        Sealer {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&out_key)),
            counter: 0,
        },
        Opener {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&in_key)),
        },
    )
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Outbound half: owns the nonce counter.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RdxError> {
        let counter = self.counter;
        self.counter = counter
            .checked_add(1)
            .ok_or(RdxError::Encoding("cipher nonce space exhausted".into()))?;

        let nonce = nonce_for(counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RdxError::Encoding("encryption failed".into()))?;

        let mut out = Vec::with_capacity(COUNTER_SIZE + sealed.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Number of payloads sealed so far.
    pub fn sealed_count(&self) -> u64 {
        self.counter
    }
}

/// Inbound half. Stateless apart from its key.
pub struct Opener {
    cipher: ChaCha20Poly1305,
}

impl Opener {
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if data.len() < SEAL_OVERHEAD {
            return Err(DecodeError::new(data.len(), "sealed payload too short"));
        }
        let mut counter = [0u8; COUNTER_SIZE];
        counter.copy_from_slice(&data[..COUNTER_SIZE]);
        let nonce = nonce_for(u64::from_be_bytes(counter));
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), &data[COUNTER_SIZE..])
            .map_err(|_| DecodeError::new(data.len(), "authentication failed"))
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").field("counter", &self.counter).finish()
    }
}

impl std::fmt::Debug for Opener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opener").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_client_keys_pair_up() {
        let (mut host_seal, host_open) = derive(b"hunter2", Side::Host);
        let (mut client_seal, client_open) = derive(b"hunter2", Side::Client);

        let to_client = host_seal.seal(b"pixels").unwrap();
        assert_eq!(client_open.open(&to_client).unwrap(), b"pixels");

        let to_host = client_seal.seal(b"ack").unwrap();
        assert_eq!(host_open.open(&to_host).unwrap(), b"ack");

        // A host cannot open its own outbound traffic.
        assert!(host_open.open(&to_client).is_err());
    }

    #[test]
    fn frames_open_out_of_order() {
        let (mut seal, _) = derive(b"k", Side::Host);
        let (_, open) = derive(b"k", Side::Client);
        let first = seal.seal(b"one").unwrap();
        let second = seal.seal(b"two").unwrap();
        assert_eq!(open.open(&second).unwrap(), b"two");
        assert_eq!(open.open(&first).unwrap(), b"one");
        assert_eq!(seal.sealed_count(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let (mut seal, _) = derive(b"k", Side::Host);
        let (_, open) = derive(b"k", Side::Client);
        let mut sealed = seal.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open.open(&sealed).is_err());
    }

    #[test]
    fn wrong_secret_fails() {
        let (mut seal, _) = derive(b"right", Side::Host);
        let (_, open) = derive(b"wrong", Side::Client);
        let sealed = seal.seal(b"payload").unwrap();
        assert!(open.open(&sealed).is_err());
    }
}
