//! Authoritative meeting snapshots and their fan-out to connected clients.
//!
//! Delivery is "latest value wins": each meeting has one watch channel, a
//! slow subscriber skips intermediate snapshots but never observes them out
//! of order, and a reconnecting client always starts from the full current
//! snapshot. The connection registry has its own lock and is never held
//! across an await, so connection churn cannot block control commands.

use crate::model::{ActivityStatus, ParticipantScope, UserRef};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Idle,
    InProgress,
    Paused,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveActivityView {
    pub status: ActivityStatus,
    pub tool: String,
    pub participant_ids: BTreeSet<UserRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivityView {
    pub activity_id: String,
    pub tool_type: String,
    pub order_index: i64,
    pub status: ActivityStatus,
    pub elapsed_ms: i64,
    pub participant_scope: ParticipantScope,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeetingSnapshot {
    pub meeting_id: String,
    /// Assigned on publish; strictly increasing per meeting.
    pub version: u64,
    pub status: MeetingStatus,
    pub current_activity: Option<String>,
    pub current_tool: Option<String>,
    pub metadata: Map<String, Value>,
    pub active_activities: BTreeMap<String, ActiveActivityView>,
    pub agenda: Vec<ActivityView>,
    pub participant_ids: BTreeSet<UserRef>,
    pub facilitator_ids: BTreeSet<UserRef>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

type SnapshotSlot = Option<Arc<MeetingSnapshot>>;

struct MeetingChannel {
    tx: watch::Sender<SnapshotSlot>,
    version: u64,
    connections: HashMap<String, Connection>,
}

impl MeetingChannel {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            version: 0,
            connections: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct Broadcaster {
    channels: Mutex<HashMap<String, MeetingChannel>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the next version and push the snapshot to every subscriber.
    pub fn publish(&self, mut snapshot: MeetingSnapshot) -> Arc<MeetingSnapshot> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => {
                warn!("broadcast registry poisoned; recovering");
                poisoned.into_inner()
            }
        };
        let channel = channels
            .entry(snapshot.meeting_id.clone())
            .or_insert_with(MeetingChannel::new);
        channel.version += 1;
        snapshot.version = channel.version;
        let snapshot = Arc::new(snapshot);
        channel.tx.send_replace(Some(snapshot.clone()));
        debug!(
            meeting_id = %snapshot.meeting_id,
            version = snapshot.version,
            subscribers = channel.tx.receiver_count(),
            "published meeting snapshot"
        );
        snapshot
    }

    /// Register `client_ref` and hand back a stream that starts with the
    /// current snapshot. Re-subscribing replaces the previous connection.
    pub fn subscribe(&self, meeting_id: &str, client_ref: &str) -> Subscription {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let channel = channels
            .entry(meeting_id.to_string())
            .or_insert_with(MeetingChannel::new);
        let connection = Connection {
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
        };
        let connection_id = connection.connection_id;
        channel
            .connections
            .insert(client_ref.to_string(), connection);
        info!(meeting_id, client_ref, %connection_id, "client subscribed");
        Subscription {
            meeting_id: meeting_id.to_string(),
            client_ref: client_ref.to_string(),
            connection_id,
            rx: channel.tx.subscribe(),
            initial_pending: true,
        }
    }

    pub fn unsubscribe(&self, meeting_id: &str, client_ref: &str) -> bool {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let removed = channels
            .get_mut(meeting_id)
            .and_then(|c| c.connections.remove(client_ref))
            .is_some();
        if removed {
            info!(meeting_id, client_ref, "client unsubscribed");
        }
        removed
    }

    /// Latest authoritative snapshot, for explicit resync requests.
    pub fn state_request(&self, meeting_id: &str) -> Option<Arc<MeetingSnapshot>> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .get(meeting_id)
            .and_then(|c| c.tx.borrow().clone())
    }

    pub fn connections(&self, meeting_id: &str) -> Vec<(String, Connection)> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<(String, Connection)> = channels
            .get(meeting_id)
            .map(|c| {
                c.connections
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Drop the meeting's channel; open subscriptions end.
    pub fn close_meeting(&self, meeting_id: &str) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(meeting_id);
        if let Some(channel) = removed {
            info!(
                meeting_id,
                connections = channel.connections.len(),
                "closed meeting channel"
            );
        }
    }
}

/// One client's view of a meeting's snapshot stream.
pub struct Subscription {
    meeting_id: String,
    client_ref: String,
    connection_id: Uuid,
    rx: watch::Receiver<SnapshotSlot>,
    initial_pending: bool,
}

impl Subscription {
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Next snapshot; the first call yields the current one if any has been
    /// published. Returns `None` once the meeting is closed.
    pub async fn recv(&mut self) -> Option<Arc<MeetingSnapshot>> {
        if self.initial_pending {
            self.initial_pending = false;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<MeetingSnapshot>> {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|snapshot| (snapshot, sub))
        })
    }
}
