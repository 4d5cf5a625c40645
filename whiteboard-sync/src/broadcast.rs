//! Per-room fan-out for the relay.
//!
//! Every room owns one tokio broadcast channel. A frame is encoded once and
//! shared as an `Arc` by all receivers; each connection filters out the
//! frames it sent itself. Receivers that fall more than `capacity` frames
//! behind lose the oldest ones (`RecvError::Lagged`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, RelayMessage};
use crate::room::RoomId;

/// An encoded frame tagged with the connection that produced it.
#[derive(Debug)]
pub struct RoutedFrame {
    pub sender: Uuid,
    pub text: String,
}

/// Per-room counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

/// One room's broadcast channel and membership.
pub struct RoomGroup {
    sender: broadcast::Sender<Arc<RoutedFrame>>,
    members: RwLock<HashSet<Uuid>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RoomGroup {
    /// Create an empty group whose channel buffers `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Encode `msg` and send it to every subscriber. Returns the number of
    /// receivers, the sender's own included.
    pub fn broadcast_from(&self, sender: Uuid, msg: &RelayMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(RoutedFrame {
            sender,
            text: msg.encode()?,
        });
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, frames: u64) {
        self.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    /// Current number of members.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the room's counters.
    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }

    /// Per-receiver buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A connection's membership in a room.
pub struct Membership {
    pub group: Arc<RoomGroup>,
    pub receiver: broadcast::Receiver<Arc<RoutedFrame>>,
    /// No one else was in the room when this member joined.
    pub first_in_room: bool,
}

/// Join refused because the room is at its member limit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room {room_id} is full ({limit} members)")]
pub struct RoomFull {
    pub room_id: RoomId,
    pub limit: usize,
}

/// Maps room ids to their groups. Rooms exist while they have members.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomGroup>>>,
    capacity: usize,
}

impl RoomRegistry {
    /// Empty registry; every room it creates gets a channel of `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Add `member` to `room_id`, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &RoomId,
        member: Uuid,
        max_members: usize,
    ) -> Result<Membership, RoomFull> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(RoomGroup::new(self.capacity)))
            .clone();

        let mut members = group.members.write().await;
        if !members.contains(&member) && members.len() >= max_members {
            let empty = members.is_empty();
            drop(members);
            if empty {
                rooms.remove(room_id);
            }
            return Err(RoomFull {
                room_id: room_id.clone(),
                limit: max_members,
            });
        }
        members.insert(member);
        let first_in_room = members.len() == 1;
        let receiver = group.sender.subscribe();
        drop(members);

        Ok(Membership {
            group,
            receiver,
            first_in_room,
        })
    }

    /// Remove `member` from `room_id`. Returns true if the room was removed
    /// because it became empty.
    pub async fn leave(&self, room_id: &RoomId, member: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room_id) else {
            return false;
        };
        let now_empty = {
            let mut members = group.members.write().await;
            members.remove(member);
            members.is_empty()
        };
        if now_empty {
            rooms.remove(room_id);
        }
        now_empty
    }

    /// Look up a live room.
    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Number of rooms that currently have members.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
