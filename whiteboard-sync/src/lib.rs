//! # whiteboard-sync: end-to-end encrypted whiteboard collaboration
//!
//! Peers in a room share one symmetric key that travels only in the URL
//! fragment of the share link. Every scene change is sealed with AES-256-GCM
//! before it leaves the process; the relay forwards ciphertext by room id and
//! never sees a key.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   server-broadcast   ┌──────────────┐   client-broadcast   ┌──────────────┐
//! │ SyncSession  │ ───────────────────► │ RelayServer  │ ───────────────────► │ SyncSession  │
//! │ (peer A)     │   {roomId, ct, iv}   │ (untrusted)  │      {ct, iv}        │ (peer B)     │
//! └──────┬───────┘                      └──────┬───────┘                      └──────┬───────┘
//!        │ seal                                │                                     │ open
//!        ▼                                     ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐                      ┌──────────────┐
//! │ RoomSecret   │                      │ RoomRegistry │                      │ Surface      │
//! │ (in-memory)  │                      │ (fan-out)    │                      │ + EchoGuard  │
//! └──────────────┘                      └──────────────┘                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`]: room ids, room secrets, key export/import
//! - [`link`]: share links `<origin>/#room=<id>,<key>`
//! - [`scene`]: scene snapshots and the [`DrawingSurface`] seam
//! - [`envelope`]: AES-256-GCM seal/open of snapshots
//! - [`protocol`]: relay wire frames (JSON text, tagged by `event`)
//! - [`echo`]: echo suppression guard
//! - [`transport`]: client WebSocket connection to the relay
//! - [`session`]: the sync session state machine
//! - [`broadcast`]: per-room fan-out used by the relay
//! - [`relay`]: reference relay server

pub mod room;
pub mod link;
pub mod scene;
pub mod envelope;
pub mod protocol;
pub mod echo;
pub mod transport;
pub mod session;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use room::{KeyError, RoomCredentials, RoomId, RoomSecret};
pub use link::{decode_share_link, encode_share_link, LinkError, RoomLink};
pub use scene::{BinaryFile, ChangeDelivery, DrawingSurface, SceneSnapshot, SceneUpdate, SharedAppState};
pub use envelope::{open, seal, Envelope, EnvelopeError};
pub use protocol::{ProtocolError, RelayMessage};
pub use echo::{EchoGuard, EchoSuppressor};
pub use session::{
    LocalChange, RemoteApply, SessionConfig, SessionError, SessionEvent, SessionState,
    SkipReason, SyncSession,
};
pub use broadcast::{RoomGroup, RoomRegistry, RoomStats};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
