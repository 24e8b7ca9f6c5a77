use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use chorus_proto::{
    control, MediaHeader, Nack, PacketType, ParticipantLeftPayload,
};

use crate::metrics::SfuMetrics;
use crate::session::{Session, SessionManager};

/// One datagram queued for sending. `socket` is the index of the server
/// socket the packet must leave from.
#[derive(Debug)]
pub struct Outbound {
    pub socket: usize,
    pub addr: SocketAddr,
    pub bytes: Bytes,
}

/// Handle to the bounded send queue. Overflow drops the packet and bumps
/// the drop counter; it never blocks the caller.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Outbound>,
    metrics: Arc<SfuMetrics>,
}

impl PacketSink {
    pub fn new(tx: mpsc::Sender<Outbound>, metrics: Arc<SfuMetrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn send(&self, socket: usize, addr: SocketAddr, bytes: Bytes) {
        if self
            .tx
            .try_send(Outbound {
                socket,
                addr,
                bytes,
            })
            .is_err()
        {
            self.metrics.record_dropped();
        }
    }
}

/// In-room fan-out of raw media bytes plus the NACK/PLI/RR relay policy.
///
/// The router forwards ciphertext untouched: it holds no media keys, and
/// routing needs only the plaintext header. The single per-packet crypto
/// check is the key-id tag, which must match the suite generation installed
/// on the sending session.
pub struct Router {
    sessions: Arc<SessionManager>,
    sink: PacketSink,
    metrics: Arc<SfuMetrics>,
}

impl Router {
    pub fn new(sessions: Arc<SessionManager>, sink: PacketSink, metrics: Arc<SfuMetrics>) -> Self {
        Self {
            sessions,
            sink,
            metrics,
        }
    }

    /// Handle an AUDIO/VIDEO datagram: rebind, cache for retransmit, fan
    /// out to every other subscribed session in the room.
    pub async fn route_media(&self, datagram: Bytes, src: SocketAddr, socket: usize) {
        let mut buf = datagram.as_ref();
        let header = match MediaHeader::decode(&mut buf) {
            Ok(h) => h,
            Err(_) => {
                self.metrics.record_dropped();
                return;
            }
        };

        let sender = match self.sessions.by_ssrc(header.ssrc).await {
            Some(s) => s,
            None => {
                self.metrics.record_dropped();
                return;
            }
        };

        if header.key_id != sender.expected_key_id() {
            trace!(ssrc = header.ssrc, key_id = header.key_id, "stale key id, dropping");
            self.metrics.record_dropped();
            return;
        }

        // NAT rebinding: the sender is wherever its packets come from now.
        self.sessions.bind_addr(&sender, src, socket).await;
        sender.record_media(&header, datagram.clone());

        let audio = header.packet_type == PacketType::Audio;
        let sender_muted = sender.is_muted();

        for receiver in self.sessions.room_sessions(sender.room_id).await {
            if receiver.session_id == sender.session_id {
                continue;
            }
            if !receiver.wants_ssrc(header.ssrc) {
                continue;
            }
            if audio && sender_muted {
                continue;
            }
            let (addr, socket) = receiver.addr();
            self.sink.send(socket, addr, datagram.clone());
        }
    }

    /// Answer a NACK from the target stream's retransmit buffer, directly
    /// to the requester.
    pub async fn relay_nack(&self, nack: &Nack, requester: SocketAddr, socket: usize) {
        let sender = match self.sessions.by_ssrc(nack.ssrc).await {
            Some(s) => s,
            None => {
                self.metrics.record_dropped();
                return;
            }
        };

        for &sequence in &nack.sequences {
            if let Some(bytes) = sender.cached_packet(sequence) {
                self.sink.send(socket, requester, bytes);
            }
        }
    }

    /// Forward a control datagram (PLI/RR) to the current address of the
    /// session owning `ssrc`.
    pub async fn relay_to_ssrc(&self, ssrc: u32, datagram: Bytes) {
        match self.sessions.by_ssrc(ssrc).await {
            Some(target) => {
                let (addr, socket) = target.addr();
                self.sink.send(socket, addr, datagram);
            }
            None => self.metrics.record_dropped(),
        }
    }

    /// Send `bytes` to every session in the room except `exclude`.
    pub async fn broadcast(&self, room_id: i64, exclude: i64, bytes: Bytes) {
        for session in self.sessions.room_sessions(room_id).await {
            if session.session_id == exclude {
                continue;
            }
            let (addr, socket) = session.addr();
            self.sink.send(socket, addr, bytes.clone());
        }
    }

    /// Announce a terminated session to the rest of its room.
    pub async fn broadcast_participant_left(&self, session: &Session) {
        let payload = ParticipantLeftPayload {
            user_id: session.user_id,
            session_id: session.session_id,
        };
        if let Ok(bytes) = control::encode_json(PacketType::ParticipantLeft, &payload) {
            self.broadcast(session.room_id, session.session_id, bytes).await;
        }
    }

    /// Broadcast a session's current media state to the rest of its room.
    pub async fn broadcast_media_state(&self, session: &Session) {
        let info = session.participant_info();
        if let Ok(bytes) = control::encode_json(PacketType::MediaState, &info) {
            self.broadcast(session.room_id, session.session_id, bytes).await;
        }
    }
}
