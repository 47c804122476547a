//! Deterministic at-rest encryption for message text.
//!
//! AES-GCM with a synthetic nonce: the nonce is derived from the key and the
//! plaintext, so the same plaintext under the same key always produces the
//! same ciphertext. The stored form is `base64(nonce || ciphertext)`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const NONCE_DOMAIN: &[u8] = b"gptgate-history-nonce-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Key is neither 16 nor 32 bytes.
    InvalidKeyLength(usize),
    /// Stored text is not valid base64 or is too short.
    Malformed,
    /// Wrong key or tampered ciphertext.
    DecryptionFailed,
    /// Decrypted bytes are not UTF-8.
    NotUtf8,
    EncryptionFailed,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyLength(len) => write!(f, "invalid key length {len} (expected 16 or 32)"),
            Self::Malformed => write!(f, "malformed ciphertext"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::NotUtf8 => write!(f, "decrypted text is not valid UTF-8"),
            Self::EncryptionFailed => write!(f, "encryption failed"),
        }
    }
}

impl std::error::Error for CipherError {}

#[derive(Clone)]
enum Backend {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

/// Process-wide message cipher.
#[derive(Clone)]
pub struct Cipher {
    key: Vec<u8>,
    aead: Backend,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key_bits", &(self.key.len() * 8)).finish()
    }
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let aead = match key.len() {
            16 => Backend::Aes128(
                Aes128Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?,
            ),
            32 => Backend::Aes256(
                Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?,
            ),
            other => return Err(CipherError::InvalidKeyLength(other)),
        };
        Ok(Self { key: key.to_vec(), aead })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce_bytes = self.synthetic_nonce(plaintext.as_bytes());
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = match &self.aead {
            Backend::Aes128(c) => c.encrypt(nonce, plaintext.as_bytes()),
            Backend::Aes256(c) => c.encrypt(nonce, plaintext.as_bytes()),
        }
        .map_err(|_| CipherError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let data = BASE64.decode(stored.as_bytes()).map_err(|_| CipherError::Malformed)?;
        if data.len() < NONCE_LEN {
            return Err(CipherError::Malformed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = match &self.aead {
            Backend::Aes128(c) => c.decrypt(nonce, ciphertext),
            Backend::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CipherError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::NotUtf8)
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(NONCE_DOMAIN);
        hasher.update((self.key.len() as u32).to_be_bytes());
        hasher.update(&self.key);
        hasher.update(plaintext);
        let digest = hasher.finalize();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }
}
