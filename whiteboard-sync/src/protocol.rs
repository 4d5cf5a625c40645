//! Relay wire protocol.
//!
//! Every frame is a JSON text WebSocket message tagged by `event`:
//! ```text
//! client ──► relay   {"event":"join-room","roomId":"…"}
//! client ──► relay   {"event":"server-broadcast","roomId":"…","ciphertext":"<b64>","iv":"<b64>"}
//! relay  ──► client  {"event":"client-broadcast","ciphertext":"<b64>","iv":"<b64>"}
//! relay  ──► client  {"event":"first-in-room"}
//! relay  ──► client  {"event":"new-user","id":"…"}
//! ```
//!
//! Envelope bytes travel as base64 so the frames stay valid text on any
//! transport. The relay never sees anything but ciphertext.

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EnvelopeError};
use crate::room::RoomId;

/// A frame exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Join a room. Idempotent.
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// Ask the relay to forward a sealed scene to every other room member.
    ServerBroadcast {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        ciphertext: String,
        iv: String,
    },
    /// A sealed scene from another member.
    ClientBroadcast { ciphertext: String, iv: String },
    /// Sent to the first member of a room.
    FirstInRoom,
    /// Another member joined; `id` is an opaque relay connection id.
    NewUser { id: String },
}

impl RelayMessage {
    pub fn join_room(room_id: RoomId) -> Self {
        Self::JoinRoom { room_id }
    }

    pub fn server_broadcast(room_id: RoomId, envelope: &Envelope) -> Self {
        let (ciphertext, iv) = envelope.to_wire();
        Self::ServerBroadcast {
            room_id,
            ciphertext,
            iv,
        }
    }

    pub fn client_broadcast(envelope: &Envelope) -> Self {
        let (ciphertext, iv) = envelope.to_wire();
        Self::ClientBroadcast { ciphertext, iv }
    }

    pub fn new_user(id: impl Into<String>) -> Self {
        Self::NewUser { id: id.into() }
    }

    /// Wire name of this frame's event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::ServerBroadcast { .. } => "server-broadcast",
            Self::ClientBroadcast { .. } => "client-broadcast",
            Self::FirstInRoom => "first-in-room",
            Self::NewUser { .. } => "new-user",
        }
    }

    /// The envelope carried by a broadcast frame, if any.
    pub fn envelope(&self) -> Option<Result<Envelope, EnvelopeError>> {
        match self {
            Self::ServerBroadcast { ciphertext, iv, .. } | Self::ClientBroadcast { ciphertext, iv } => {
                Some(Envelope::from_wire(ciphertext, iv))
            }
            _ => None,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection closed")]
    ConnectionClosed,
}
