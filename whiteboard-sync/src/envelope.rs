//! Authenticated encryption of scene snapshots.
//!
//! ```text
//! SceneSnapshot ──serde_json──► plaintext ──AES-256-GCM(key, nonce)──► ciphertext‖tag
//!                                                  ▲
//!                                   12 random bytes per seal
//! ```
//!
//! The whole snapshot, attached files included, is one authenticated unit.
//! Nonces come from the OS CSPRNG on every call, never from a counter, so
//! peers that reconnect or share a key never have to coordinate nonce state.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::room::RoomSecret;
use crate::scene::SceneSnapshot;

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Envelope codec failures.
///
/// Messages never include key material or plaintext.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("entropy source unavailable while generating nonce")]
    EntropyUnavailable,
    #[error("failed to serialize scene: {0}")]
    Serialization(String),
    #[error("encryption failed")]
    Encryption,
    #[error("envelope failed authentication")]
    Decryption,
    #[error("decrypted payload is not a scene snapshot ({0})")]
    Deserialization(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
}

/// Sealed snapshot as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

impl Envelope {
    /// Text-safe form: base64 of ciphertext and nonce.
    pub fn to_wire(&self) -> (String, String) {
        (STANDARD.encode(&self.ciphertext), STANDARD.encode(self.nonce))
    }

    /// Parse the text-safe form.
    pub fn from_wire(ciphertext: &str, iv: &str) -> Result<Self, EnvelopeError> {
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|_| EnvelopeError::MalformedEnvelope("ciphertext is not base64"))?;
        if ciphertext.len() < TAG_SIZE {
            return Err(EnvelopeError::MalformedEnvelope("ciphertext shorter than tag"));
        }

        let iv = STANDARD
            .decode(iv)
            .map_err(|_| EnvelopeError::MalformedEnvelope("nonce is not base64"))?;
        let nonce: [u8; NONCE_SIZE] = iv
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::MalformedEnvelope("nonce must be 96 bits"))?;

        Ok(Self { ciphertext, nonce })
    }

    /// Sealed size in bytes (ciphertext + nonce).
    pub fn sealed_size(&self) -> usize {
        self.ciphertext.len() + NONCE_SIZE
    }
}

fn cipher(secret: &RoomSecret) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret.as_bytes()))
}

/// Location-only description of a JSON error; the error's own message can
/// quote plaintext.
fn describe(e: &serde_json::Error) -> String {
    format!("{:?} error at line {} column {}", e.classify(), e.line(), e.column())
}

/// Serialize and encrypt a snapshot under a fresh random nonce.
pub fn seal(secret: &RoomSecret, snapshot: &SceneSnapshot) -> Result<Envelope, EnvelopeError> {
    let plaintext =
        serde_json::to_vec(snapshot).map_err(|e| EnvelopeError::Serialization(describe(&e)))?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| EnvelopeError::EntropyUnavailable)?;

    let ciphertext = cipher(secret)
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| EnvelopeError::Encryption)?;

    Ok(Envelope { ciphertext, nonce })
}

/// Verify, decrypt and deserialize an envelope.
pub fn open(secret: &RoomSecret, envelope: &Envelope) -> Result<SceneSnapshot, EnvelopeError> {
    let plaintext = cipher(secret)
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| EnvelopeError::Decryption)?;

    serde_json::from_slice(&plaintext).map_err(|e| EnvelopeError::Deserialization(describe(&e)))
}
