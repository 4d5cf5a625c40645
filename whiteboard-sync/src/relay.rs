//! Reference WebSocket relay.
//!
//! ```text
//! Client A ──┐                       ┌──► Client B   client-broadcast
//!            ├── Room (RoomId) ── RoomGroup
//! Client B ──┘                       └──► Client C
//! ```
//!
//! The relay routes by room id only. It forwards ciphertext and never holds
//! a key, so it cannot read, merge or validate scenes.
//!
//! Per connection:
//! - `join-room` subscribes the socket to the room's group (leaving any
//!   previous room); the first member gets `first-in-room`, the others get
//!   `new-user` with the joiner's socket id.
//! - `server-broadcast` is re-emitted as `client-broadcast` to every other
//!   member of that room.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{Membership, RoomGroup, RoomRegistry, RoutedFrame};
use crate::protocol::{ProtocolError, RelayMessage};
use crate::room::RoomId;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3002".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    registry: Arc<RoomRegistry>,
    counters: Arc<Counters>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self::from_listener(config, listener))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(config: RelayConfig, listener: TcpListener) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        Self {
            config,
            listener,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let counters = self.counters.clone();
            let max_peers = self.config.max_peers_per_room;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, counters, max_peers).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        counters: Arc<Counters>,
        max_peers: usize,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let socket_id = Uuid::new_v4();
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Socket {socket_id} connected from {addr}");

        let mut joined: Option<(RoomId, Arc<RoomGroup>)> = None;
        let mut room_rx: Option<broadcast::Receiver<Arc<RoutedFrame>>> = None;

        let result: Result<(), RelayError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                counters.total_frames.fetch_add(1, Ordering::Relaxed);
                                counters.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                                let frame = match RelayMessage::decode(text.as_str()) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {socket_id}: {e}");
                                        continue;
                                    }
                                };

                                match frame {
                                    RelayMessage::JoinRoom { room_id } => {
                                        if joined.as_ref().is_some_and(|(current, _)| *current == room_id) {
                                            log::debug!("Socket {socket_id} already in room {room_id}");
                                            continue;
                                        }
                                        if let Some((previous, _)) = joined.take() {
                                            room_rx = None;
                                            if registry.leave(&previous, &socket_id).await {
                                                log::info!("Room {previous} removed (empty)");
                                            }
                                        }

                                        match registry.join(&room_id, socket_id, max_peers).await {
                                            Ok(Membership { group, receiver, first_in_room }) => {
                                                log::info!("Socket {socket_id} joined room {room_id}");
                                                // Recorded before any send so every exit path leaves the room
                                                room_rx = Some(receiver);
                                                joined = Some((room_id, group.clone()));

                                                if first_in_room {
                                                    let text = RelayMessage::FirstInRoom.encode()?;
                                                    ws_sender.send(Message::Text(text.into())).await?;
                                                } else {
                                                    group.broadcast_from(
                                                        socket_id,
                                                        &RelayMessage::new_user(socket_id.to_string()),
                                                    )?;
                                                }
                                            }
                                            Err(e) => log::warn!("Refusing join from {socket_id}: {e}"),
                                        }
                                    }

                                    RelayMessage::ServerBroadcast { room_id, ciphertext, iv } => {
                                        match &joined {
                                            Some((current, group)) if *current == room_id => {
                                                let forwarded = RelayMessage::ClientBroadcast { ciphertext, iv };
                                                let receivers = group.broadcast_from(socket_id, &forwarded)?;
                                                log::trace!("Forwarded frame in room {room_id} to {} peers", receivers.saturating_sub(1));
                                            }
                                            _ => log::warn!("Ignoring broadcast from {socket_id} to room {room_id} it has not joined"),
                                        }
                                    }

                                    other => {
                                        log::debug!("Ignoring {} frame from {socket_id}", other.event_name());
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Socket {socket_id} closed");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {socket_id}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    routed = async {
                        match room_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match routed {
                            Ok(frame) => {
                                if frame.sender == socket_id {
                                    continue;
                                }
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Socket {socket_id} lagged by {n} frames");
                                if let Some((_, group)) = &joined {
                                    group.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                room_rx = None;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some((room_id, _)) = joined.take() {
            if registry.leave(&room_id, &socket_id).await {
                log::info!("Room {room_id} removed (empty)");
            }
        }
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);

        result
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Rooms currently served.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Connection, traffic and room counters.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }
}
