//! Per-user authenticated encryption of face templates.
//!
//! Each user's key is `PBKDF2-HMAC-SHA256(master_secret, SHA-256(user_id))`,
//! and every blob is laid out as `nonce(12) ‖ ciphertext ‖ tag(16)` under
//! AES-256-GCM. A fresh nonce is drawn from the OS CSPRNG on every call:
//! the key is stable per user and shared by all of that user's templates.

use crate::types::{Embedding, EmbeddingError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("master secret is empty")]
    EmptySecret,
    /// Tag verification failed: the blob was modified, or it belongs to
    /// another user or another master secret.
    #[error("template authentication failed (tampered or keyed to another identity)")]
    TamperOrKeyMismatch,
    #[error("blob too short: {len} bytes, need at least {}", NONCE_LEN + TAG_LEN)]
    MalformedBlob { len: usize },
    #[error("encryption failed")]
    Encryption,
    #[error("decrypted payload is not an embedding: {0}")]
    InvalidPlaintext(#[from] EmbeddingError),
}

/// Root key-derivation input. Never logged.
#[derive(Clone)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CipherError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CipherError::EmptySecret);
        }
        Ok(Self(bytes))
    }

    fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// A derived per-user AES-256 key. Lives only for the duration of a call or scan.
pub struct UserKey([u8; KEY_LEN]);

/// Derive the AES key for `user_id`.
pub fn derive_key(secret: &MasterSecret, user_id: &str, iterations: u32) -> UserKey {
    let salt = Sha256::digest(user_id.as_bytes());
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.expose(), &salt, iterations, &mut key);
    UserKey(key)
}

/// Encrypts and decrypts template payloads for individual users.
#[derive(Debug, Clone)]
pub struct TemplateCipher {
    secret: MasterSecret,
    iterations: u32,
}

impl TemplateCipher {
    pub fn new(secret: MasterSecret) -> Self {
        Self {
            secret,
            iterations: PBKDF2_ITERATIONS,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_iterations(secret: MasterSecret, iterations: u32) -> Self {
        Self { secret, iterations }
    }

    pub fn derive_key(&self, user_id: &str) -> UserKey {
        derive_key(&self.secret, user_id, self.iterations)
    }

    pub fn encrypt(&self, plaintext: &[u8], user_id: &str) -> Result<Vec<u8>, CipherError> {
        encrypt_with_key(&self.derive_key(user_id), plaintext)
    }

    pub fn decrypt(&self, blob: &[u8], user_id: &str) -> Result<Vec<u8>, CipherError> {
        decrypt_with_key(&self.derive_key(user_id), blob)
    }

    /// Encrypt an embedding for storage as a template.
    pub fn seal_embedding(&self, embedding: &Embedding, user_id: &str) -> Result<Vec<u8>, CipherError> {
        self.encrypt(&embedding.to_bytes(), user_id)
    }

    pub fn open_embedding(&self, blob: &[u8], user_id: &str) -> Result<Embedding, CipherError> {
        open_embedding_with_key(&self.derive_key(user_id), blob)
    }
}

pub fn encrypt_with_key(key: &UserKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CipherError::Encryption)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    // aes-gcm appends the tag, so the output is already `ciphertext ‖ tag`.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

pub fn decrypt_with_key(key: &UserKey, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CipherError::MalformedBlob { len: blob.len() });
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CipherError::Encryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CipherError::TamperOrKeyMismatch)
}

pub fn open_embedding_with_key(key: &UserKey, blob: &[u8]) -> Result<Embedding, CipherError> {
    let plaintext = decrypt_with_key(key, blob)?;
    Ok(Embedding::from_bytes(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::with_similarity;

    const FAST: u32 = 1_000;

    fn cipher(secret: &str) -> TemplateCipher {
        TemplateCipher::with_iterations(MasterSecret::new(secret).unwrap(), FAST)
    }

    #[test]
    fn test_round_trip() {
        let c = cipher("master");
        for plaintext in [&b""[..], b"x", b"a somewhat longer template payload"] {
            let blob = c.encrypt(plaintext, "alice").unwrap();
            assert_eq!(blob.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(c.decrypt(&blob, "alice").unwrap(), plaintext);
        }
    }

    #[test]
    fn test_round_trip_with_production_iterations() {
        let c = TemplateCipher::new(MasterSecret::new("master").unwrap());
        let embedding = with_similarity(0.7);
        let blob = c.seal_embedding(&embedding, "alice").unwrap();
        assert_eq!(c.open_embedding(&blob, "alice").unwrap(), embedding);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let c = cipher("master");
        let a = c.encrypt(b"same", "alice").unwrap();
        let b = c.encrypt(b"same", "alice").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let c = cipher("master");
        let key = c.derive_key("alice");
        let blob = encrypt_with_key(&key, b"sixteen byte msg").unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        decrypt_with_key(&key, &tampered),
                        Err(CipherError::TamperOrKeyMismatch)
                    ),
                    "flip at byte {byte} bit {bit} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn test_cross_user_isolation() {
        let c = cipher("master");
        let blob = c.encrypt(b"alice's face", "A").unwrap();
        assert!(matches!(c.decrypt(&blob, "B"), Err(CipherError::TamperOrKeyMismatch)));
    }

    #[test]
    fn test_other_master_secret_fails() {
        let blob = cipher("generation-1").encrypt(b"payload", "alice").unwrap();
        let result = cipher("generation-2").decrypt(&blob, "alice");
        assert!(matches!(result, Err(CipherError::TamperOrKeyMismatch)));
    }

    #[test]
    fn test_short_blob_is_malformed() {
        let c = cipher("master");
        let result = c.decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1], "alice");
        assert!(matches!(result, Err(CipherError::MalformedBlob { len: 27 })));
    }

    #[test]
    fn test_wrong_plaintext_shape_rejected() {
        let c = cipher("master");
        let blob = c.encrypt(&[0u8; 64], "alice").unwrap();
        assert!(matches!(
            c.open_embedding(&blob, "alice"),
            Err(CipherError::InvalidPlaintext(EmbeddingError::WrongByteLength(64)))
        ));
    }

    #[test]
    fn test_derive_key_deterministic_and_user_bound() {
        let secret = MasterSecret::new("master").unwrap();
        assert_eq!(derive_key(&secret, "alice", FAST).0, derive_key(&secret, "alice", FAST).0);
        assert_ne!(derive_key(&secret, "alice", FAST).0, derive_key(&secret, "bob", FAST).0);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(MasterSecret::new(""), Err(CipherError::EmptySecret)));
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = MasterSecret::new("hunter2").unwrap();
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
