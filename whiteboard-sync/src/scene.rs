//! Scene snapshots and the drawing-surface seam.
//!
//! A [`SceneSnapshot`] is the unit of synchronization: every broadcast carries
//! the full shareable scene, and applying one replaces the remote-visible part
//! of the receiver's canvas. Elements stay opaque JSON; only the surface knows
//! their shape.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// View state that is safe to share between participants.
///
/// Per-user view state (scroll, zoom, selection) is never part of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAppState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_background_color: Option<String>,
}

impl SharedAppState {
    /// Pick the shareable fields out of a surface's full app state.
    pub fn from_app_state(app_state: &Value) -> Self {
        Self {
            view_background_color: app_state
                .get("viewBackgroundColor")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// A binary asset attached to the scene, e.g. a pasted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFile {
    pub id: String,
    pub mime_type: String,
    #[serde(rename = "dataURL")]
    pub data_url: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created: u64,
    /// Fields this crate does not interpret, kept so they survive a round trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Full shareable scene at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub elements: Vec<Value>,
    #[serde(default)]
    pub app_state: SharedAppState,
    #[serde(default)]
    pub files: BTreeMap<String, BinaryFile>,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SceneSnapshot {
    /// Snapshot the scene now.
    pub fn capture(
        elements: Vec<Value>,
        app_state: SharedAppState,
        files: BTreeMap<String, BinaryFile>,
    ) -> Self {
        Self {
            elements,
            app_state,
            files,
            timestamp: now_millis(),
        }
    }

    /// Snapshot straight from a surface change callback's raw arguments.
    pub fn from_change(
        elements: Vec<Value>,
        app_state: &Value,
        files: BTreeMap<String, BinaryFile>,
    ) -> Self {
        Self::capture(elements, SharedAppState::from_app_state(app_state), files)
    }

    /// Total bytes of attached file payloads.
    pub fn file_bytes(&self) -> usize {
        self.files.values().map(|f| f.data_url.len()).sum()
    }
}

/// What the surface receives when a remote snapshot is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneUpdate {
    pub elements: Vec<Value>,
    pub app_state: SharedAppState,
    pub files: BTreeMap<String, BinaryFile>,
}

impl From<SceneSnapshot> for SceneUpdate {
    fn from(snapshot: SceneSnapshot) -> Self {
        Self {
            elements: snapshot.elements,
            app_state: snapshot.app_state,
            files: snapshot.files,
        }
    }
}

/// How a surface reports the change caused by [`DrawingSurface::update_scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDelivery {
    /// The change callback, if any, has fired by the time `update_scene` returns.
    Synchronous,
    /// The callback fires later (e.g. batched to the next frame).
    Deferred,
}

/// The canvas collaborator.
///
/// The application forwards the surface's own change callback to
/// [`crate::session::SyncSession::on_local_change`]; the session calls
/// `update_scene` to apply remote snapshots.
pub trait DrawingSurface {
    /// Replace the shareable part of the scene.
    fn update_scene(&mut self, update: SceneUpdate);

    fn change_delivery(&self) -> ChangeDelivery {
        ChangeDelivery::Synchronous
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
