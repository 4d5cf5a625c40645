//! Room identity and key material.
//!
//! A room is addressed publicly by a [`RoomId`] and secured by a [`RoomSecret`].
//! The relay only ever sees the id. The secret travels out-of-band, inside the
//! fragment of a share link (see [`crate::link`]).

use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// AES-256-GCM key size in bytes.
pub const SECRET_SIZE: usize = 32;

/// Random bytes behind a generated room id (20 hex chars).
pub const ROOM_ID_BYTES: usize = 10;

/// Longest room id accepted from links or the wire.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Errors from key generation and key/room-id parsing.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),
    #[error("malformed room key: {0}")]
    MalformedKey(&'static str),
    #[error("malformed room id")]
    MalformedRoomId,
}

fn fill_random(buf: &mut [u8]) -> Result<(), KeyError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| KeyError::EntropyUnavailable(e.to_string()))
}

/// Symmetric room key.
///
/// Zeroed on drop. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSecret([u8; SECRET_SIZE]);

impl RoomSecret {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; SECRET_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Export as a URL-safe base64 token (no padding).
    pub fn export(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Import a token produced by [`RoomSecret::export`].
    ///
    /// The standard base64 alphabet is accepted too, padded or not, so links
    /// minted by clients using plain base64 still open.
    pub fn import(token: &str) -> Result<Self, KeyError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(KeyError::MalformedKey("empty token"));
        }

        let mut decoded = [URL_SAFE_NO_PAD, URL_SAFE, STANDARD, STANDARD_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(token).ok())
            .ok_or(KeyError::MalformedKey("not valid base64"))?;

        if decoded.len() != SECRET_SIZE {
            decoded.zeroize();
            return Err(KeyError::MalformedKey("expected a 256-bit key"));
        }

        let mut bytes = [0u8; SECRET_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for RoomSecret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Drop for RoomSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for RoomSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomSecret(..)")
    }
}

/// Public routing identifier for a room. Carries no secrecy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Generate a 20-character lowercase hex id.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        fill_random(&mut bytes)?;
        Ok(Self(bytes.iter().map(|b| format!("{b:02x}")).collect()))
    }

    /// Validate an id received from a link or the relay.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty()
            || raw.len() > MAX_ROOM_ID_LEN
            || !raw.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(KeyError::MalformedRoomId);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to (re)join a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCredentials {
    pub room_id: RoomId,
    pub secret: RoomSecret,
}

impl RoomCredentials {
    /// Fresh id and key for a new session.
    pub fn generate() -> Result<Self, KeyError> {
        Ok(Self {
            room_id: RoomId::generate()?,
            secret: RoomSecret::generate()?,
        })
    }

    /// Rebuild credentials from the two halves of a share-link fragment.
    pub fn from_parts(room_id: &str, token: &str) -> Result<Self, KeyError> {
        Ok(Self {
            room_id: RoomId::parse(room_id)?,
            secret: RoomSecret::import(token)?,
        })
    }

    /// Exported key token for this room.
    pub fn token(&self) -> String {
        self.secret.export()
    }
}
