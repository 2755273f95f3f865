//! End-to-end stream encryption
//!
//! Payload bytes are encrypted between ingress and exit only; transit agents
//! forward opaque ciphertext. Each side contributes an ephemeral X25519 key
//! carried in STREAM_OPEN / STREAM_OPEN_ACK, the shared secret keys
//! ChaCha20-Poly1305, and each direction runs its own nonce counter (the
//! direction byte keeps the two counters from ever colliding). STREAM_DATA
//! frames arrive in per-stream order, so counter nonces stay in lockstep.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// AEAD tag overhead per sealed chunk.
pub const TAG_LEN: usize = 16;

/// Direction markers baked into nonces.
const DIR_INGRESS_TO_EXIT: u8 = 0;
const DIR_EXIT_TO_INGRESS: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("peer public key must be 32 bytes, got {0}")]
    BadPublicKey(usize),
    #[error("payload failed authentication")]
    Tampered,
}

/// One half of the handshake: generated at open time, consumed when the
/// counterpart key arrives.
pub struct Ephemeral {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Ephemeral {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Derive the ingress-side cipher pair from the exit's public key.
    pub fn into_ingress_session(self, exit_public: &[u8]) -> Result<(SealCipher, OpenCipher), CryptoError> {
        self.into_session(exit_public, DIR_INGRESS_TO_EXIT)
    }

    /// Derive the exit-side cipher pair from the ingress's public key.
    pub fn into_exit_session(self, ingress_public: &[u8]) -> Result<(SealCipher, OpenCipher), CryptoError> {
        self.into_session(ingress_public, DIR_EXIT_TO_INGRESS)
    }

    fn into_session(self, their_public: &[u8], send_dir: u8) -> Result<(SealCipher, OpenCipher), CryptoError> {
        let bytes: [u8; 32] = their_public
            .try_into()
            .map_err(|_| CryptoError::BadPublicKey(their_public.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        let key = Key::from_slice(shared.as_bytes());
        let seal = SealCipher {
            cipher: ChaCha20Poly1305::new(key),
            dir: send_dir,
            counter: 0,
        };
        let open = OpenCipher {
            cipher: ChaCha20Poly1305::new(key),
            dir: 1 - send_dir,
            counter: 0,
        };
        Ok((seal, open))
    }
}

fn nonce_for(dir: u8, counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[0] = dir;
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Sealing side of one stream direction.
pub struct SealCipher {
    cipher: ChaCha20Poly1305,
    dir: u8,
    counter: u64,
}

impl std::fmt::Debug for SealCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealCipher").field("dir", &self.dir).field("counter", &self.counter).finish()
    }
}

impl SealCipher {
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = nonce_for(self.dir, self.counter);
        self.counter += 1;
        self.cipher
            .encrypt(&nonce, plaintext)
            .expect("chacha20poly1305 encryption is infallible for in-memory buffers")
    }
}

/// Opening side of one stream direction.
pub struct OpenCipher {
    cipher: ChaCha20Poly1305,
    dir: u8,
    counter: u64,
}

impl std::fmt::Debug for OpenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCipher").field("dir", &self.dir).field("counter", &self.counter).finish()
    }
}

impl OpenCipher {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.dir, self.counter);
        let plain = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| CryptoError::Tampered)?;
        self.counter += 1;
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> ((SealCipher, OpenCipher), (SealCipher, OpenCipher)) {
        let ingress = Ephemeral::generate();
        let exit = Ephemeral::generate();
        let ingress_pub = ingress.public_key_bytes();
        let exit_pub = exit.public_key_bytes();
        let ingress_session = ingress.into_ingress_session(&exit_pub).unwrap();
        let exit_session = exit.into_exit_session(&ingress_pub).unwrap();
        (ingress_session, exit_session)
    }

    #[test]
    fn test_both_directions_roundtrip() {
        let ((mut ingress_seal, mut ingress_open), (mut exit_seal, mut exit_open)) = session_pair();

        let sealed = ingress_seal.seal(b"request bytes");
        assert_ne!(sealed, b"request bytes");
        assert_eq!(exit_open.open(&sealed).unwrap(), b"request bytes");

        let sealed = exit_seal.seal(b"response bytes");
        assert_eq!(ingress_open.open(&sealed).unwrap(), b"response bytes");
    }

    #[test]
    fn test_counters_keep_repeated_plaintext_distinct() {
        let ((mut seal, _), (_, mut open)) = session_pair();
        let first = seal.seal(b"same");
        let second = seal.seal(b"same");
        assert_ne!(first, second);
        assert_eq!(open.open(&first).unwrap(), b"same");
        assert_eq!(open.open(&second).unwrap(), b"same");
    }

    #[test]
    fn test_out_of_order_chunk_rejected() {
        let ((mut seal, _), (_, mut open)) = session_pair();
        let _first = seal.seal(b"one");
        let second = seal.seal(b"two");
        // Skipping a chunk desynchronises the counter and must not decrypt.
        assert!(matches!(open.open(&second), Err(CryptoError::Tampered)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let ((mut seal, _), (_, mut open)) = session_pair();
        let mut sealed = seal.seal(b"payload");
        sealed[0] ^= 0x01;
        assert!(matches!(open.open(&sealed), Err(CryptoError::Tampered)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let ((mut seal, _), _) = session_pair();
        let (_, (_, mut other_open)) = session_pair();
        let sealed = seal.seal(b"payload");
        assert!(other_open.open(&sealed).is_err());
    }

    #[test]
    fn test_seal_overhead_is_tag_len() {
        let ((mut seal, _), _) = session_pair();
        let sealed = seal.seal(b"1234");
        assert_eq!(sealed.len(), 4 + TAG_LEN);
    }
}
