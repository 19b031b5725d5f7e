//! Authenticated encryption for cached values.
//!
//! Encrypted output = `[nonce (12 bytes)] || [ciphertext + auth_tag]`.
//!
//! The key is stretched from a passphrase with HKDF-SHA256 and every value
//! gets a fresh random nonce, so identical values encrypt differently.
//! Tampered or foreign ciphertext fails authentication and reads as a miss.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use super::codec::{CodecCacheStore, CodecError, ValueCodec};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const HKDF_SALT: &[u8] = b"multiorm-cache-v1";
const HKDF_INFO: &[u8] = b"multiorm cache value encryption";

/// Store wrapper that encrypts values.
pub type EncryptedCacheStore = CodecCacheStore<ChaChaCodec>;

/// ChaCha20-Poly1305 codec.
pub struct ChaChaCodec {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChaChaCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ChaChaCodec {
    /// Derive the key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CodecError> {
        Ok(Self::from_key(Self::derive_key(passphrase.as_bytes())?))
    }

    /// Use a raw 256-bit key.
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(GenericArray::from_slice(&key)),
        }
    }

    fn derive_key(input: &[u8]) -> Result<[u8; KEY_SIZE], CodecError> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), input);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| CodecError::Encryption(format!("key derivation failed: {e}")))?;
        Ok(key)
    }
}

impl ValueCodec for ChaChaCodec {
    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|e| CodecError::Encryption(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CodecError> {
        if stored.len() < NONCE_SIZE {
            return Err(CodecError::Malformed("ciphertext shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = stored.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CodecError::Encryption(e.to_string()))
    }
}
