//! Sync session: one membership of one encrypted room.
//!
//! ```text
//!            start()                connect ok          join sent
//!   Idle ───────────────► Connecting ──────────► Joining ─────────► Active
//!    ▲                        │                                      │
//!    └──── connect error ─────┘                    stop() / socket drop
//!                                                                    ▼
//!                          start() ◄──────────────────────────── Disconnected
//! ```
//!
//! Outbound: the surface's change callback → [`SyncSession::on_local_change`]
//! → seal → `server-broadcast`.
//! Inbound: `client-broadcast` → [`SessionEvent::RemoteScene`] → the
//! application loop → [`SyncSession::on_remote_message`] → open → surface.
//!
//! While a remote snapshot is being applied the echo guard is held, so the
//! change callback that apply triggers is recognised and not re-broadcast.
//! The guard covers exactly the one `update_scene` call unless the surface
//! declares [`ChangeDelivery::Deferred`].
//!
//! `SyncSession` is a cheap `Clone` handle; clones share one session.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use url::Url;

use crate::echo::EchoSuppressor;
use crate::envelope::{self, Envelope, EnvelopeError};
use crate::link::{encode_share_link, LinkError};
use crate::protocol::{ProtocolError, RelayMessage};
use crate::room::{KeyError, RoomCredentials, RoomId};
use crate::scene::{ChangeDelivery, DrawingSurface, SceneSnapshot};
use crate::transport::RelayConnection;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL
    pub relay_url: String,
    /// Origin used when rendering share links
    pub origin: String,
    /// Frames buffered towards the relay before local changes are dropped
    pub outgoing_capacity: usize,
    /// Events buffered for the application
    pub event_capacity: usize,
    /// How long the echo guard is held for surfaces with deferred change delivery
    pub echo_fallback_delay: Duration,
    /// Consecutive undecryptable messages before a key mismatch is reported
    pub decrypt_warning_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3002".to_string(),
            origin: "http://localhost:5173".to_string(),
            outgoing_capacity: 256,
            event_capacity: 256,
            echo_fallback_delay: Duration::from_millis(100),
            decrypt_warning_threshold: 3,
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Joining,
    Active,
    Disconnected,
}

/// Events for the application loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Joined the room and ready to sync
    Active { room_id: RoomId },
    /// A sealed scene from a peer; feed it to [`SyncSession::on_remote_message`]
    RemoteScene(Envelope),
    /// We are the first member of the room
    FirstInRoom,
    /// Another member joined (opaque relay id)
    MemberJoined(String),
    /// Several consecutive peer messages failed to open
    KeyMismatchSuspected { consecutive_failures: u32 },
    /// Connection to the relay ended
    Disconnected,
}

/// Why a local change was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotActive,
    EchoSuppressed,
    ConnectionClosed,
    /// Outgoing channel full; the next change carries the latest scene anyway
    Backpressure,
}

/// Outcome of [`SyncSession::on_local_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    Sent,
    Skipped(SkipReason),
}

/// Outcome of [`SyncSession::on_remote_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteApply {
    Applied,
    /// The envelope did not open; the session carries on
    Dropped(EnvelopeError),
    /// The session is not active; nothing was touched
    Inactive,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("relay connection failed: {0}")]
    Connection(ProtocolError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),
}

struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    room: Mutex<Option<RoomCredentials>>,
    connection: Mutex<Option<RelayConnection>>,
    echo: EchoSuppressor,
    /// Serializes seal + enqueue
    outbound: Mutex<()>,
    /// Serializes open + apply
    inbound: Mutex<()>,
    decrypt_failures: AtomicU32,
    /// Bumped on every start/stop so tasks from an older connection stand down
    epoch: AtomicU64,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::warn!("Session event queue full, dropping {event:?}");
        }
    }

    /// Count an unopenable peer message; report a likely key mismatch once
    /// the streak reaches the configured threshold.
    fn record_failure(&self, error: &EnvelopeError) {
        let failures = self.decrypt_failures.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("Dropping peer message that failed to open: {error}");

        let threshold = self.config.decrypt_warning_threshold.max(1);
        if failures % threshold == 0 {
            log::warn!(
                "{failures} consecutive peer messages failed to open; peers may hold a different room key"
            );
            self.emit(SessionEvent::KeyMismatchSuspected {
                consecutive_failures: failures,
            });
        }
    }

    /// Tear down after the socket dropped, unless a newer start/stop already
    /// took over.
    fn connection_lost(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch || *state != SessionState::Active {
                return;
            }
            *state = SessionState::Disconnected;
        }
        if let Some(conn) = self.connection.lock().take() {
            conn.close();
        }
        self.room.lock().take();
        log::info!("Relay connection lost; session disconnected");
        self.emit(SessionEvent::Disconnected);
    }
}

/// Handle to an encrypted sync session.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Create an idle session.
    pub fn new(config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(SessionInner {
                config,
                state: Mutex::new(SessionState::Idle),
                room: Mutex::new(None),
                connection: Mutex::new(None),
                echo: EchoSuppressor::new(),
                outbound: Mutex::new(()),
                inbound: Mutex::new(()),
                decrypt_failures: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Idle session with [`SessionConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.inner.event_rx.lock().take()
    }

    /// Start a session: a fresh room when `existing` is `None`, otherwise
    /// rejoin the given room.
    ///
    /// Returns the room credentials so the caller can share them or present
    /// them again to rejoin after a disconnect.
    pub async fn start(
        &self,
        existing: Option<RoomCredentials>,
    ) -> Result<RoomCredentials, SessionError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Idle | SessionState::Disconnected => {
                    *state = SessionState::Connecting
                }
                other => return Err(SessionError::InvalidState(other)),
            }
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let credentials = match existing {
            Some(credentials) => credentials,
            None => match RoomCredentials::generate() {
                Ok(credentials) => credentials,
                Err(e) => {
                    log::error!("Cannot create room: {e}");
                    self.reset_if_current(epoch, SessionState::Idle);
                    return Err(e.into());
                }
            },
        };
        let room_id = credentials.room_id.clone();

        log::info!("Connecting to relay {}", self.inner.config.relay_url);
        let (connection, inbound) = match RelayConnection::open(
            &self.inner.config.relay_url,
            self.inner.config.outgoing_capacity.max(1),
        )
        .await
        {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("Relay connection failed: {e}");
                self.reset_if_current(epoch, SessionState::Idle);
                return Err(SessionError::Connection(e));
            }
        };

        if !self.advance_if_current(epoch, SessionState::Connecting, SessionState::Joining) {
            connection.close();
            return Err(SessionError::InvalidState(self.state()));
        }

        if let Err(e) = connection.send(RelayMessage::join_room(room_id.clone())).await {
            log::error!("Failed to join room {room_id}: {e}");
            connection.close();
            self.reset_if_current(epoch, SessionState::Idle);
            return Err(SessionError::Connection(e));
        }

        if let Err(current) = self.commit_join(epoch, &credentials, connection) {
            return Err(SessionError::InvalidState(current));
        }

        log::info!("Joined room {room_id}");
        self.inner.emit(SessionEvent::Active { room_id });
        tokio::spawn(Self::pump(self.inner.clone(), inbound, epoch));

        Ok(credentials)
    }

    /// Forward relay frames to the application as events.
    async fn pump(
        inner: Arc<SessionInner>,
        mut inbound: mpsc::Receiver<RelayMessage>,
        epoch: u64,
    ) {
        while let Some(frame) = inbound.recv().await {
            if inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let event = match frame {
                RelayMessage::ClientBroadcast { ciphertext, iv } => {
                    match Envelope::from_wire(&ciphertext, &iv) {
                        Ok(envelope) => SessionEvent::RemoteScene(envelope),
                        Err(e) => {
                            inner.record_failure(&e);
                            continue;
                        }
                    }
                }
                RelayMessage::FirstInRoom => {
                    log::info!("First member in room");
                    SessionEvent::FirstInRoom
                }
                RelayMessage::NewUser { id } => {
                    log::info!("New member joined: {id}");
                    SessionEvent::MemberJoined(id)
                }
                other => {
                    log::debug!("Ignoring unexpected {} frame from relay", other.event_name());
                    continue;
                }
            };
            if inner.event_tx.send(event).await.is_err() {
                log::debug!("Event receiver dropped; stopping relay pump");
                return;
            }
        }
        inner.connection_lost(epoch);
    }

    /// Seal and broadcast a local change.
    ///
    /// Call this from the drawing surface's change callback. Inactive
    /// sessions, suppressed echoes and closed connections are reported as
    /// [`LocalChange::Skipped`], not as errors.
    pub fn on_local_change(&self, snapshot: &SceneSnapshot) -> Result<LocalChange, SessionError> {
        if self.inner.state() != SessionState::Active {
            return Ok(LocalChange::Skipped(SkipReason::NotActive));
        }
        if self.inner.echo.is_engaged() {
            log::trace!("Suppressing echo of applied remote scene");
            return Ok(LocalChange::Skipped(SkipReason::EchoSuppressed));
        }
        if !self.connection_open() {
            return Ok(LocalChange::Skipped(SkipReason::ConnectionClosed));
        }

        let _outbound = self.inner.outbound.lock();

        let (room_id, sealed) = {
            let room = self.inner.room.lock();
            let Some(credentials) = room.as_ref() else {
                return Ok(LocalChange::Skipped(SkipReason::NotActive));
            };
            (credentials.room_id.clone(), envelope::seal(&credentials.secret, snapshot)?)
        };

        // stop() may have run while sealing
        if self.inner.state() != SessionState::Active {
            return Ok(LocalChange::Skipped(SkipReason::NotActive));
        }

        let frame = RelayMessage::server_broadcast(room_id, &sealed);
        let connection = self.inner.connection.lock();
        let Some(conn) = connection.as_ref() else {
            return Ok(LocalChange::Skipped(SkipReason::ConnectionClosed));
        };
        match conn.try_send(frame) {
            Ok(()) => {
                log::trace!("Queued scene broadcast ({} bytes sealed)", sealed.sealed_size());
                Ok(LocalChange::Sent)
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Outgoing relay queue full; dropping local change");
                Ok(LocalChange::Skipped(SkipReason::Backpressure))
            }
            Err(TrySendError::Closed(_)) => Ok(LocalChange::Skipped(SkipReason::ConnectionClosed)),
        }
    }

    /// Open a peer's envelope and apply it to the surface.
    ///
    /// Failures to open drop the message and leave the session active. The
    /// surface must not call back into `on_remote_message` from `update_scene`.
    pub fn on_remote_message<S>(&self, envelope: &Envelope, surface: &mut S) -> RemoteApply
    where
        S: DrawingSurface + ?Sized,
    {
        let _inbound = self.inner.inbound.lock();

        if self.inner.state() != SessionState::Active {
            return RemoteApply::Inactive;
        }

        let opened = {
            let room = self.inner.room.lock();
            match room.as_ref() {
                Some(credentials) => envelope::open(&credentials.secret, envelope),
                None => return RemoteApply::Inactive,
            }
        };

        let snapshot = match opened {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.inner.record_failure(&e);
                return RemoteApply::Dropped(e);
            }
        };
        self.inner.decrypt_failures.store(0, Ordering::SeqCst);

        if self.inner.state() != SessionState::Active {
            return RemoteApply::Inactive;
        }

        log::debug!(
            "Applying remote scene: {} elements, {} files ({} bytes)",
            snapshot.elements.len(),
            snapshot.files.len(),
            snapshot.file_bytes()
        );

        let delivery = surface.change_delivery();
        let guard = self.inner.echo.engage();
        surface.update_scene(snapshot.into());
        match delivery {
            ChangeDelivery::Synchronous => drop(guard),
            ChangeDelivery::Deferred => guard.release_after(self.inner.config.echo_fallback_delay),
        }

        RemoteApply::Applied
    }

    /// Leave the room: close the connection and forget the key.
    pub fn stop(&self) {
        let (connection, room) = {
            let mut state = self.inner.state.lock();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            *state = SessionState::Disconnected;
            (self.inner.connection.lock().take(), self.inner.room.lock().take())
        };
        if let Some(conn) = connection {
            conn.close();
        }
        if let Some(credentials) = room {
            log::info!("Left room {}", credentials.room_id);
        }
        self.inner.emit(SessionEvent::Disconnected);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Id of the joined room, if any.
    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.room.lock().as_ref().map(|c| c.room_id.clone())
    }

    /// Share link for the current room.
    pub fn share_link(&self) -> Result<Option<Url>, SessionError> {
        let room = self.inner.room.lock();
        match room.as_ref() {
            Some(credentials) => Ok(Some(encode_share_link(
                &credentials.room_id,
                &credentials.token(),
                &self.inner.config.origin,
            )?)),
            None => Ok(None),
        }
    }

    /// Whether echo suppression is currently held.
    pub fn is_suppressing_echo(&self) -> bool {
        self.inner.echo.is_engaged()
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Install the room and connection and go `Joining` -> `Active`, all
    /// under the state lock. A stale epoch or a state other than `Joining`
    /// leaves the session untouched; the connection is closed and the
    /// current state returned.
    fn commit_join(
        &self,
        epoch: u64,
        credentials: &RoomCredentials,
        connection: RelayConnection,
    ) -> Result<(), SessionState> {
        let rejected = {
            let mut state = self.inner.state.lock();
            if self.inner.epoch.load(Ordering::SeqCst) == epoch && *state == SessionState::Joining {
                *self.inner.room.lock() = Some(credentials.clone());
                *self.inner.connection.lock() = Some(connection);
                self.inner.decrypt_failures.store(0, Ordering::SeqCst);
                *state = SessionState::Active;
                return Ok(());
            }
            *state
        };
        connection.close();
        Err(rejected)
    }

    fn connection_open(&self) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(RelayConnection::is_open)
    }

    fn advance_if_current(&self, epoch: u64, from: SessionState, to: SessionState) -> bool {
        let mut state = self.inner.state.lock();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch || *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn reset_if_current(&self, epoch: u64, to: SessionState) {
        let mut state = self.inner.state.lock();
        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            *state = to;
        }
    }
}
