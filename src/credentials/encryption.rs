//! AES-256-GCM sealing for vault blobs.
//!
//! The cipher key is derived per install: `SHA-256(master_key || salt)`.
//! Rotating the salt therefore changes the effective key without touching
//! the master key. Every seal uses a fresh random nonce.

use crate::error::{IntegrationError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of the master key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of a freshly generated salt in bytes
const SALT_SIZE: usize = 16;

/// Envelope format version written into every blob.
const ENVELOPE_VERSION: u8 = 1;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|e| IntegrationError::Config(format!("encryption key is not valid base64: {e}")))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(IntegrationError::Config(format!(
            "encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// A per-install salt mixed into the cipher key.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// Generates a new random salt.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a salt from its stored (base64) form.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| IntegrationError::Corruption(format!("salt is not valid base64: {e}")))?;
        if bytes.len() != SALT_SIZE {
            return Err(IntegrationError::Corruption(format!(
                "salt must be {} bytes, got {}",
                SALT_SIZE,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Stored (base64) form.
    pub fn encode(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Short fingerprint recorded in sealed blobs so a blob sealed under a
    /// different salt is rejected without attempting decryption.
    pub fn reference(&self) -> String {
        let digest = Sha256::digest(&self.0);
        BASE64.encode(&digest[..6])
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt({})", self.reference())
    }
}

/// Serialized form of a sealed secret.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(master_key: &[u8], salt: &Salt) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(master_key);
    hasher.update(&salt.0);
    hasher.finalize().into()
}

/// Encrypts `plaintext` and returns the opaque blob to persist.
pub fn seal(plaintext: &str, master_key: &[u8], salt: &Salt) -> Result<String> {
    let key = derive_key(master_key, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| IntegrationError::Storage(format!("failed to create cipher: {e}")))?;

    // Generate random nonce (never reuse!)
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|e| IntegrationError::Storage(format!("encryption failed: {e}")))?;

    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        salt: salt.reference(),
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
    };

    serde_json::to_string(&envelope)
        .map_err(|e| IntegrationError::Storage(format!("failed to encode envelope: {e}")))
}

/// Decrypts a blob produced by [`seal`].
///
/// Every failure (bad shape, salt mismatch, wrong key, tampering) is a
/// [`IntegrationError::Corruption`].
pub fn open(blob: &str, master_key: &[u8], salt: &Salt) -> Result<String> {
    let envelope: Envelope = serde_json::from_str(blob)
        .map_err(|e| IntegrationError::Corruption(format!("malformed envelope: {e}")))?;

    if envelope.v != ENVELOPE_VERSION {
        return Err(IntegrationError::Corruption(format!(
            "unsupported envelope version {}",
            envelope.v
        )));
    }
    if envelope.salt != salt.reference() {
        return Err(IntegrationError::Corruption(
            "blob was sealed under a different salt".to_string(),
        ));
    }

    let nonce_bytes = BASE64
        .decode(&envelope.nonce)
        .map_err(|e| IntegrationError::Corruption(format!("failed to decode nonce: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(IntegrationError::Corruption(format!(
            "invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|e| IntegrationError::Corruption(format!("failed to decode ciphertext: {e}")))?;

    let key = derive_key(master_key, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| IntegrationError::Corruption(format!("failed to create cipher: {e}")))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| IntegrationError::Corruption("decryption failed".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| IntegrationError::Corruption("decrypted data is not valid UTF-8".to_string()))
}
