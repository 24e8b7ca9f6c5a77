use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One event flowing through the hub. Voice uses `voice_user_joined`,
/// `voice_user_left` and `voice_state_changed`.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: Arc<serde_json::Value>,
    /// Room this event belongs to, if applicable.
    pub room_id: Option<i64>,
    /// When set, only deliver to the listed users (e.g. DM peers).
    pub target_user_ids: Option<Vec<i64>>,
}

#[derive(Clone)]
struct SessionSubscription {
    user_id: i64,
    room_ids: HashSet<i64>,
    sender: broadcast::Sender<ServerEvent>,
}

/// Broadcast-based event bus for real-time fan-out toward gateway sessions.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    sessions: Arc<DashMap<String, SessionSubscription>>,
    room_sessions: Arc<DashMap<i64, HashSet<String>>>,
    user_sessions: Arc<DashMap<i64, HashSet<String>>>,
    system_sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (system_sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            sessions: Arc::new(DashMap::new()),
            room_sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
            system_sender,
        }
    }

    /// Firehose of every published event, regardless of scoping.
    pub fn subscribe_system(&self) -> broadcast::Receiver<ServerEvent> {
        self.system_sender.subscribe()
    }

    pub fn register_session(
        &self,
        session_id: impl Into<String>,
        user_id: i64,
        room_ids: &[i64],
    ) -> broadcast::Receiver<ServerEvent> {
        let (sender, receiver) = broadcast::channel(self.capacity.max(256));
        let sid = session_id.into();

        for &room_id in room_ids {
            self.room_sessions
                .entry(room_id)
                .or_default()
                .insert(sid.clone());
        }
        self.user_sessions
            .entry(user_id)
            .or_default()
            .insert(sid.clone());

        self.sessions.insert(
            sid,
            SessionSubscription {
                user_id,
                room_ids: room_ids.iter().copied().collect(),
                sender,
            },
        );
        receiver
    }

    pub fn unregister_session(&self, session_id: &str) {
        if let Some((_, sub)) = self.sessions.remove(session_id) {
            for room_id in &sub.room_ids {
                if let Some(mut sids) = self.room_sessions.get_mut(room_id) {
                    sids.remove(session_id);
                    if sids.is_empty() {
                        drop(sids);
                        self.room_sessions.remove(room_id);
                    }
                }
            }
            if let Some(mut sids) = self.user_sessions.get_mut(&sub.user_id) {
                sids.remove(session_id);
                if sids.is_empty() {
                    drop(sids);
                    self.user_sessions.remove(&sub.user_id);
                }
            }
        }
    }

    pub fn publish(&self, event: ServerEvent) {
        let session_ids: Vec<String> = if let Some(ref targets) = event.target_user_ids {
            let mut ids = Vec::new();
            for uid in targets {
                if let Some(user_sids) = self.user_sessions.get(uid) {
                    ids.extend(user_sids.iter().cloned());
                }
            }
            ids
        } else if let Some(room_id) = event.room_id {
            self.room_sessions
                .get(&room_id)
                .map(|sids| sids.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            self.sessions.iter().map(|e| e.key().clone()).collect()
        };

        let _ = self.system_sender.send(event.clone());

        for sid in session_ids {
            if let Some(sub) = self.sessions.get(&sid) {
                let _ = sub.sender.send(event.clone());
            }
        }
    }

    /// Publish a room-scoped event.
    pub fn dispatch(&self, event_type: &str, payload: serde_json::Value, room_id: Option<i64>) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: Arc::new(payload),
            room_id,
            target_user_ids: None,
        });
    }

    /// Publish an event delivered only to the specified users.
    pub fn dispatch_to_users(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        target_user_ids: Vec<i64>,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: Arc::new(payload),
            room_id: None,
            target_user_ids: Some(target_user_ids),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
