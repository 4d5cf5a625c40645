//! End-to-end tests: real sessions syncing through a real relay.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use whiteboard_sync::envelope::{Envelope, EnvelopeError};
use whiteboard_sync::link::decode_share_link;
use whiteboard_sync::relay::{RelayConfig, RelayServer};
use whiteboard_sync::room::RoomCredentials;
use whiteboard_sync::scene::{DrawingSurface, SceneSnapshot, SceneUpdate, SharedAppState};
use whiteboard_sync::session::{
    LocalChange, RemoteApply, SessionConfig, SessionEvent, SessionState, SkipReason, SyncSession,
};

/// Start a relay on a free port, return its URL.
async fn start_test_relay() -> (Arc<RelayServer>, String) {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = Arc::new(RelayServer::bind(config).await.unwrap());
    let url = format!("ws://{}", server.local_addr().unwrap());

    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    (server, url)
}

fn session(relay_url: &str) -> (SyncSession, mpsc::Receiver<SessionEvent>) {
    let session = SyncSession::new(SessionConfig {
        relay_url: relay_url.to_string(),
        ..SessionConfig::default()
    });
    let events = session.take_event_rx().unwrap();
    (session, events)
}

fn scene(ids: &[&str]) -> SceneSnapshot {
    SceneSnapshot::capture(
        ids.iter().map(|id| json!({ "id": id, "type": "rectangle" })).collect(),
        SharedAppState::default(),
        BTreeMap::new(),
    )
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Skip events until one matches.
async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

async fn next_remote_scene(events: &mut mpsc::Receiver<SessionEvent>) -> Envelope {
    match wait_for(events, |e| matches!(e, SessionEvent::RemoteScene(_))).await {
        SessionEvent::RemoteScene(envelope) => envelope,
        _ => unreachable!(),
    }
}

/// No remote scene arrives for a short while.
async fn assert_no_remote_scene(events: &mut mpsc::Receiver<SessionEvent>) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        assert!(
            !matches!(event, SessionEvent::RemoteScene(_)),
            "unexpected remote scene"
        );
    }
}

/// A canvas whose change callback fires synchronously from `update_scene`,
/// wired straight back into the session like a real application would.
struct Canvas {
    session: SyncSession,
    applied: Vec<SceneUpdate>,
    callbacks: Vec<LocalChange>,
}

impl Canvas {
    fn new(session: &SyncSession) -> Self {
        Self {
            session: session.clone(),
            applied: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    fn element_ids(&self) -> Vec<String> {
        self.applied
            .last()
            .map(|u| {
                u.elements
                    .iter()
                    .filter_map(|e| e["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DrawingSurface for Canvas {
    fn update_scene(&mut self, update: SceneUpdate) {
        let change = SceneSnapshot::capture(
            update.elements.clone(),
            update.app_state.clone(),
            update.files.clone(),
        );
        self.applied.push(update);
        self.callbacks.push(self.session.on_local_change(&change).unwrap());
    }
}

/// A starts fresh, B joins with A's credentials and both are in the room.
async fn joined_pair(
    url: &str,
) -> (
    (SyncSession, mpsc::Receiver<SessionEvent>),
    (SyncSession, mpsc::Receiver<SessionEvent>),
    RoomCredentials,
) {
    let (a, mut a_events) = session(url);
    let credentials = a.start(None).await.unwrap();
    assert_eq!(
        next_event(&mut a_events).await,
        SessionEvent::Active {
            room_id: credentials.room_id.clone()
        }
    );
    assert_eq!(next_event(&mut a_events).await, SessionEvent::FirstInRoom);

    let (b, mut b_events) = session(url);
    b.start(Some(credentials.clone())).await.unwrap();
    assert!(matches!(next_event(&mut b_events).await, SessionEvent::Active { .. }));
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::MemberJoined(_))).await;

    ((a, a_events), (b, b_events), credentials)
}

#[tokio::test]
async fn test_edit_reaches_peer_without_echo() {
    let (_relay, url) = start_test_relay().await;
    let ((a, mut a_events), (b, mut b_events), _) = joined_pair(&url).await;
    assert_eq!(a.state(), SessionState::Active);
    assert_eq!(b.state(), SessionState::Active);

    assert_eq!(a.on_local_change(&scene(&["shape1"])).unwrap(), LocalChange::Sent);

    let envelope = next_remote_scene(&mut b_events).await;
    let mut canvas_b = Canvas::new(&b);
    assert_eq!(b.on_remote_message(&envelope, &mut canvas_b), RemoteApply::Applied);
    assert_eq!(canvas_b.element_ids(), vec!["shape1"]);

    // B's change callback fired during apply and was suppressed
    assert_eq!(
        canvas_b.callbacks,
        vec![LocalChange::Skipped(SkipReason::EchoSuppressed)]
    );
    assert_no_remote_scene(&mut a_events).await;

    // A genuine edit by B reaches A exactly once
    assert_eq!(
        b.on_local_change(&scene(&["shape1", "shape2"])).unwrap(),
        LocalChange::Sent
    );
    let envelope = next_remote_scene(&mut a_events).await;
    let mut canvas_a = Canvas::new(&a);
    assert_eq!(a.on_remote_message(&envelope, &mut canvas_a), RemoteApply::Applied);
    assert_eq!(canvas_a.element_ids(), vec!["shape1", "shape2"]);
    assert_no_remote_scene(&mut a_events).await;
    assert_no_remote_scene(&mut b_events).await;
}

#[tokio::test]
async fn test_join_via_share_link() {
    let (_relay, url) = start_test_relay().await;
    let (a, mut a_events) = session(&url);
    a.start(None).await.unwrap();

    let link = a.share_link().unwrap().unwrap();
    let credentials = decode_share_link(link.as_str()).unwrap().credentials().unwrap();

    let (b, mut b_events) = session(&url);
    b.start(Some(credentials)).await.unwrap();
    assert_eq!(a.room_id(), b.room_id());
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::MemberJoined(_))).await;

    a.on_local_change(&scene(&["linked"])).unwrap();
    let envelope = next_remote_scene(&mut b_events).await;
    let mut canvas_b = Canvas::new(&b);
    assert_eq!(b.on_remote_message(&envelope, &mut canvas_b), RemoteApply::Applied);
    assert_eq!(canvas_b.element_ids(), vec!["linked"]);
}

#[tokio::test]
async fn test_stop_and_rejoin_with_same_credentials() {
    let (_relay, url) = start_test_relay().await;
    let ((a, mut a_events), (b, mut b_events), credentials) = joined_pair(&url).await;

    b.stop();
    assert_eq!(b.state(), SessionState::Disconnected);
    assert!(b.room_id().is_none());
    wait_for(&mut b_events, |e| *e == SessionEvent::Disconnected).await;

    // Edits while B is away are not delivered to it
    assert_eq!(
        b.on_local_change(&scene(&["offline"])).unwrap(),
        LocalChange::Skipped(SkipReason::NotActive)
    );

    b.start(Some(credentials)).await.unwrap();
    assert_eq!(b.state(), SessionState::Active);
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::MemberJoined(_))).await;

    a.on_local_change(&scene(&["after-rejoin"])).unwrap();
    let envelope = next_remote_scene(&mut b_events).await;
    let mut canvas_b = Canvas::new(&b);
    assert_eq!(b.on_remote_message(&envelope, &mut canvas_b), RemoteApply::Applied);
    assert_eq!(canvas_b.element_ids(), vec!["after-rejoin"]);
}

#[tokio::test]
async fn test_peer_with_wrong_key_is_reported() {
    let (_relay, url) = start_test_relay().await;
    let (a, mut a_events) = session(&url);
    let credentials = a.start(None).await.unwrap();

    // Same room id, different key
    let impostor_credentials = RoomCredentials {
        room_id: credentials.room_id.clone(),
        secret: RoomCredentials::generate().unwrap().secret,
    };
    let (impostor, _impostor_events) = session(&url);
    impostor.start(Some(impostor_credentials)).await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::MemberJoined(_))).await;

    let mut canvas_a = Canvas::new(&a);
    for i in 0..3 {
        impostor.on_local_change(&scene(&[format!("bad{i}").as_str()])).unwrap();
        let envelope = next_remote_scene(&mut a_events).await;
        assert_eq!(
            a.on_remote_message(&envelope, &mut canvas_a),
            RemoteApply::Dropped(EnvelopeError::Decryption)
        );
    }

    assert_eq!(
        wait_for(&mut a_events, |e| matches!(e, SessionEvent::KeyMismatchSuspected { .. })).await,
        SessionEvent::KeyMismatchSuspected {
            consecutive_failures: 3
        }
    );
    assert!(canvas_a.applied.is_empty());
    assert_eq!(a.state(), SessionState::Active);
}

#[tokio::test]
async fn test_relay_drop_disconnects_session() {
    // A relay that accepts one join and then hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _join = ws.next().await;
        let _ = ws.send(Message::Close(None)).await;
    });

    let (a, mut a_events) = session(&url);
    a.start(None).await.unwrap();

    wait_for(&mut a_events, |e| *e == SessionEvent::Disconnected).await;
    assert_eq!(a.state(), SessionState::Disconnected);
    assert!(a.room_id().is_none());
    assert_eq!(
        a.on_local_change(&scene(&["lost"])).unwrap(),
        LocalChange::Skipped(SkipReason::NotActive)
    );
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (_relay, url) = start_test_relay().await;
    let (a, _a_events) = session(&url);
    a.start(None).await.unwrap();
    assert!(a.start(None).await.is_err());
    assert_eq!(a.state(), SessionState::Active);
}
