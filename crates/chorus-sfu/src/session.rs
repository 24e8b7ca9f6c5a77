use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use chorus_crypto::{CryptoSuite, SessionCrypto};
use chorus_proto::{MediaHeader, PacketType, ParticipantInfo};

use crate::retransmit::RetransmitBuffer;

/// Mutable half of a session, guarded by the session's own lock.
#[derive(Debug)]
pub struct SessionState {
    pub udp_addr: SocketAddr,
    /// Index of the server socket this client last talked to; replies go
    /// out the same socket so NAT mappings stay valid.
    pub socket: usize,
    pub last_activity: Instant,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub speaking: bool,
    pub audio_seq: u16,
    pub video_seq: u16,
    pub audio_ts: u32,
    pub video_ts: u32,
    /// SSRCs this client wants forwarded; empty means everything.
    pub subscriptions: HashSet<u32>,
    pub retransmit: RetransmitBuffer,
}

/// One joined media client.
///
/// Identity and allocated SSRCs are immutable for the session's lifetime;
/// everything that changes mid-call lives in [`SessionState`] behind a
/// short-held mutex. The AEAD handle is installed from the HELLO crypto
/// block and is only consulted for its key-id tag; the SFU never decrypts
/// media.
pub struct Session {
    pub session_id: i64,
    pub user_id: i64,
    pub room_id: i64,
    pub audio_ssrc: u32,
    pub video_ssrc: Option<u32>,
    pub screen_ssrc: Option<u32>,
    crypto: SessionCrypto,
    state: Mutex<SessionState>,
}

impl Session {
    /// Current destination for packets toward this client.
    pub fn addr(&self) -> (SocketAddr, usize) {
        let state = self.state.lock().unwrap();
        (state.udp_addr, state.socket)
    }

    pub fn touch(&self) {
        self.state.lock().unwrap().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().unwrap().last_activity.elapsed()
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().unwrap().muted
    }

    pub fn expected_key_id(&self) -> u8 {
        self.crypto.short_key_id()
    }

    pub fn owns_ssrc(&self, ssrc: u32) -> bool {
        self.audio_ssrc == ssrc
            || self.video_ssrc == Some(ssrc)
            || self.screen_ssrc == Some(ssrc)
    }

    /// Whether this session wants packets from `ssrc` forwarded to it.
    pub fn wants_ssrc(&self, ssrc: u32) -> bool {
        let state = self.state.lock().unwrap();
        state.subscriptions.is_empty() || state.subscriptions.contains(&ssrc)
    }

    pub fn set_subscriptions(&self, ssrcs: impl IntoIterator<Item = u32>) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions = ssrcs.into_iter().collect();
        state.last_activity = Instant::now();
    }

    pub fn set_media_flags(&self, muted: bool, video_enabled: bool, screen_sharing: bool) {
        let mut state = self.state.lock().unwrap();
        state.muted = muted;
        state.video_enabled = video_enabled;
        state.screen_sharing = screen_sharing;
        state.last_activity = Instant::now();
    }

    pub fn set_speaking(&self, speaking: bool) {
        let mut state = self.state.lock().unwrap();
        state.speaking = speaking;
        state.last_activity = Instant::now();
    }

    /// Record sequence/timestamp counters from a routed media header and
    /// stash the wire bytes for retransmission.
    pub fn record_media(&self, header: &MediaHeader, wire_bytes: bytes::Bytes) {
        let mut state = self.state.lock().unwrap();
        match header.packet_type {
            PacketType::Audio => {
                state.audio_seq = header.sequence;
                state.audio_ts = header.timestamp;
            }
            PacketType::Video => {
                state.video_seq = header.sequence;
                state.video_ts = header.timestamp;
            }
            _ => {}
        }
        state.retransmit.insert(header.sequence, wire_bytes);
        state.last_activity = Instant::now();
    }

    pub fn cached_packet(&self, sequence: u16) -> Option<bytes::Bytes> {
        self.state.lock().unwrap().retransmit.get(sequence)
    }

    /// Snapshot for WELCOME lists and MEDIA_STATE broadcasts.
    pub fn participant_info(&self) -> ParticipantInfo {
        let state = self.state.lock().unwrap();
        ParticipantInfo {
            user_id: self.user_id,
            audio_ssrc: self.audio_ssrc,
            video_ssrc: self.video_ssrc,
            screen_ssrc: self.screen_ssrc,
            muted: state.muted,
            video_enabled: state.video_enabled,
            screen_sharing: state.screen_sharing,
            speaking: state.speaking,
        }
    }
}

#[derive(Default)]
struct Registry {
    by_session_id: HashMap<i64, Arc<Session>>,
    by_ssrc: HashMap<u32, Arc<Session>>,
    by_addr: HashMap<SocketAddr, Arc<Session>>,
    by_user_room: HashMap<(i64, i64), Arc<Session>>,
    rooms: HashMap<i64, HashSet<i64>>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>) {
        let (addr, _) = session.addr();
        self.by_session_id.insert(session.session_id, session.clone());
        self.by_ssrc.insert(session.audio_ssrc, session.clone());
        if let Some(ssrc) = session.video_ssrc {
            self.by_ssrc.insert(ssrc, session.clone());
        }
        if let Some(ssrc) = session.screen_ssrc {
            self.by_ssrc.insert(ssrc, session.clone());
        }
        self.by_addr.insert(addr, session.clone());
        self.by_user_room
            .insert((session.user_id, session.room_id), session.clone());
        self.rooms
            .entry(session.room_id)
            .or_default()
            .insert(session.session_id);
    }

    fn remove(&mut self, session_id: i64) -> Option<Arc<Session>> {
        let session = self.by_session_id.remove(&session_id)?;

        self.by_ssrc.remove(&session.audio_ssrc);
        if let Some(ssrc) = session.video_ssrc {
            self.by_ssrc.remove(&ssrc);
        }
        if let Some(ssrc) = session.screen_ssrc {
            self.by_ssrc.remove(&ssrc);
        }

        // Only drop the address / user-room entries if they still point at
        // this session; a replacement may already have claimed them.
        let (addr, _) = session.addr();
        if self
            .by_addr
            .get(&addr)
            .is_some_and(|s| s.session_id == session_id)
        {
            self.by_addr.remove(&addr);
        }
        let key = (session.user_id, session.room_id);
        if self
            .by_user_room
            .get(&key)
            .is_some_and(|s| s.session_id == session_id)
        {
            self.by_user_room.remove(&key);
        }

        if let Some(members) = self.rooms.get_mut(&session.room_id) {
            members.remove(&session_id);
            if members.is_empty() {
                self.rooms.remove(&session.room_id);
            }
        }

        Some(session)
    }
}

/// Multi-indexed registry of live media sessions.
///
/// All four indices mutate under one writer lock, so readers never observe
/// a session present in one index and absent from another. SSRC and
/// session-id allocation are monotonic for the process lifetime.
pub struct SessionManager {
    inner: RwLock<Registry>,
    next_session_id: AtomicI64,
    next_ssrc: AtomicU32,
    retransmit_ttl: Duration,
}

impl SessionManager {
    pub fn new(retransmit_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            next_session_id: AtomicI64::new(1),
            next_ssrc: AtomicU32::new(1),
            retransmit_ttl,
        }
    }

    fn alloc_ssrc(&self) -> u32 {
        self.next_ssrc.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a session for `(user_id, room_id)`, evicting any live session
    /// for the same pair in the same critical section. Returns the new
    /// session and the evicted one, if any.
    pub async fn create(
        &self,
        user_id: i64,
        room_id: i64,
        addr: SocketAddr,
        socket: usize,
        suite: &CryptoSuite,
        video_enabled: bool,
    ) -> (Arc<Session>, Option<Arc<Session>>) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let audio_ssrc = self.alloc_ssrc();
        let (video_ssrc, screen_ssrc) = if video_enabled {
            (Some(self.alloc_ssrc()), Some(self.alloc_ssrc()))
        } else {
            (None, None)
        };

        let session = Arc::new(Session {
            session_id,
            user_id,
            room_id,
            audio_ssrc,
            video_ssrc,
            screen_ssrc,
            crypto: SessionCrypto::new(suite),
            state: Mutex::new(SessionState {
                udp_addr: addr,
                socket,
                last_activity: Instant::now(),
                muted: false,
                video_enabled,
                screen_sharing: false,
                speaking: false,
                audio_seq: 0,
                video_seq: 0,
                audio_ts: 0,
                video_ts: 0,
                subscriptions: HashSet::new(),
                retransmit: RetransmitBuffer::new(self.retransmit_ttl),
            }),
        });

        let mut registry = self.inner.write().await;
        let stale_id = registry
            .by_user_room
            .get(&(user_id, room_id))
            .map(|s| s.session_id);
        let evicted = stale_id.and_then(|id| registry.remove(id));
        registry.insert(session.clone());
        (session, evicted)
    }

    /// Update a session's source address (NAT rebinding). Also touches
    /// activity. No-op if the address is unchanged.
    pub async fn bind_addr(&self, session: &Arc<Session>, addr: SocketAddr, socket: usize) {
        let (current, current_socket) = session.addr();
        if current == addr && current_socket == socket {
            session.touch();
            return;
        }

        let mut registry = self.inner.write().await;
        if registry
            .by_addr
            .get(&current)
            .is_some_and(|s| s.session_id == session.session_id)
        {
            registry.by_addr.remove(&current);
        }
        registry.by_addr.insert(addr, session.clone());
        {
            let mut state = session.state.lock().unwrap();
            state.udp_addr = addr;
            state.socket = socket;
            state.last_activity = Instant::now();
        }
    }

    pub async fn touch(&self, session_id: i64) {
        if let Some(session) = self.by_session_id(session_id).await {
            session.touch();
        }
    }

    pub async fn remove(&self, session_id: i64) -> Option<Arc<Session>> {
        self.inner.write().await.remove(session_id)
    }

    pub async fn by_session_id(&self, session_id: i64) -> Option<Arc<Session>> {
        self.inner.read().await.by_session_id.get(&session_id).cloned()
    }

    pub async fn by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        self.inner.read().await.by_ssrc.get(&ssrc).cloned()
    }

    pub async fn by_addr(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.inner.read().await.by_addr.get(&addr).cloned()
    }

    pub async fn by_user_room(&self, user_id: i64, room_id: i64) -> Option<Arc<Session>> {
        self.inner
            .read()
            .await
            .by_user_room
            .get(&(user_id, room_id))
            .cloned()
    }

    /// Snapshot of the sessions currently in a room.
    pub async fn room_sessions(&self, room_id: i64) -> Vec<Arc<Session>> {
        let registry = self.inner.read().await;
        registry
            .rooms
            .get(&room_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| registry.by_session_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every session idle for longer than `timeout`; returns the
    /// removed sessions so callers can announce them.
    pub async fn cleanup_inactive(&self, timeout: Duration) -> Vec<Arc<Session>> {
        let mut registry = self.inner.write().await;
        let stale: Vec<i64> = registry
            .by_session_id
            .values()
            .filter(|s| s.idle_for() > timeout)
            .map(|s| s.session_id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| registry.remove(id))
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_session_id.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}
