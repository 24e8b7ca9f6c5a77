//! End-to-end tests over real loopback UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uuid::Uuid;

use chorus_crypto::{mint_voice_token, AeadKind, CryptoSuite, VOICE_AUDIENCE};
use chorus_proto::{
    control, Codec, HelloPayload, MediaHeader, MediaStateUpdate, Nack, PacketType,
    ParticipantInfo, ParticipantLeftPayload, SpeakingPayload, WelcomePayload, MAX_PACKET_SIZE,
    MEDIA_HEADER_SIZE, PROTOCOL_VERSION,
};
use chorus_sfu::{SfuConfig, UdpServer};

const SECRET: &str = "sfu-test-secret";
const RECV_DEADLINE: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

struct Harness {
    server: Arc<UdpServer>,
    server_id: Uuid,
    addr: SocketAddr,
    suite: CryptoSuite,
}

async fn start_server(config: Option<SfuConfig>) -> Harness {
    let server_id = Uuid::new_v4();
    let mut config = config.unwrap_or_else(|| SfuConfig::new(server_id, SECRET));
    config.server_id = server_id;
    config.bind_host = "127.0.0.1".to_string();
    config.port_start = 0;

    let server = UdpServer::start(config).await.expect("server start");
    let addr = server.local_addrs()[0];
    Harness {
        server,
        server_id,
        addr,
        suite: CryptoSuite::generate(AeadKind::Aes256Gcm),
    }
}

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Client {
    async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        Self { socket, server }
    }

    async fn send(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.server).await.expect("send");
    }

    async fn recv(&self) -> Bytes {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(RECV_DEADLINE, self.socket.recv_from(&mut buf))
            .await
            .expect("recv deadline")
            .expect("recv");
        Bytes::copy_from_slice(&buf[..len])
    }

    /// Receive until a packet of the wanted type arrives, skipping others.
    async fn recv_type(&self, wanted: PacketType) -> Bytes {
        let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {wanted:?}"
            );
            let packet = self.recv().await;
            if packet.first() == Some(&(wanted as u8)) {
                return packet;
            }
        }
    }

    /// Assert nothing arrives within the silence window.
    async fn expect_silence(&self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let result = timeout(SILENCE_WINDOW, self.socket.recv_from(&mut buf)).await;
        assert!(result.is_err(), "expected silence, got a packet");
    }

    async fn join(&self, harness: &Harness, user_id: i64, room_id: i64, video: bool) -> WelcomePayload {
        let token = mint_voice_token(user_id, room_id, harness.server_id, SECRET, 120)
            .expect("mint token");
        let hello = HelloPayload {
            token,
            protocol_version: PROTOCOL_VERSION,
            audio_codec: "opus".to_string(),
            video_codec: video.then(|| "h264".to_string()),
            video_enabled: video,
            crypto: harness.suite.to_params(),
        };
        let packet = control::encode_json(PacketType::Hello, &hello).expect("encode hello");
        self.send(&packet).await;

        let welcome = self.recv_type(PacketType::Welcome).await;
        control::decode_json(&welcome[1..]).expect("welcome payload")
    }
}

fn audio_packet(suite: &CryptoSuite, ssrc: u32, sequence: u16) -> Bytes {
    let mut header = MediaHeader::new(PacketType::Audio, Codec::Opus, ssrc);
    header.key_id = suite.short_key_id();
    header.sequence = sequence;
    header.timestamp = sequence as u32 * 960;
    header.counter = sequence as u64;
    let mut buf = BytesMut::with_capacity(MEDIA_HEADER_SIZE + 64);
    header.encode(&mut buf);
    // Opaque ciphertext from the server's point of view.
    buf.extend_from_slice(&[sequence as u8; 64]);
    buf.freeze()
}

#[tokio::test]
async fn two_party_audio_forwards_identical_bytes() {
    let harness = start_server(None).await;

    let alice = Client::connect(harness.addr).await;
    let alice_welcome = alice.join(&harness, 1, 10, false).await;
    assert!(alice_welcome.participants.is_empty());

    let bob = Client::connect(harness.addr).await;
    let bob_welcome = bob.join(&harness, 2, 10, false).await;
    assert_eq!(bob_welcome.participants.len(), 1);
    let listed = &bob_welcome.participants[0];
    assert_eq!(listed.user_id, 1);
    assert_eq!(listed.audio_ssrc, alice_welcome.audio_ssrc);
    assert!(!listed.muted);
    assert!(!listed.video_enabled);

    // Alice learns about Bob's join.
    let state = alice.recv_type(PacketType::MediaState).await;
    let info: ParticipantInfo = control::decode_json(&state[1..]).unwrap();
    assert_eq!(info.user_id, 2);

    let packet = audio_packet(&harness.suite, alice_welcome.audio_ssrc, 1);
    alice.send(&packet).await;

    let forwarded = bob.recv_type(PacketType::Audio).await;
    assert_eq!(forwarded, packet, "ciphertext must be forwarded untouched");
}

#[tokio::test]
async fn mute_suppresses_audio_but_not_speaking() {
    let harness = start_server(None).await;

    let alice = Client::connect(harness.addr).await;
    let alice_welcome = alice.join(&harness, 1, 20, false).await;
    let bob = Client::connect(harness.addr).await;
    bob.join(&harness, 2, 20, false).await;

    // Alice mutes herself.
    let update = MediaStateUpdate {
        muted: true,
        video_enabled: false,
        screen_sharing: false,
    };
    let packet = control::encode_json(PacketType::MediaState, &update).unwrap();
    alice.send(&packet).await;

    let state = bob.recv_type(PacketType::MediaState).await;
    let info: ParticipantInfo = control::decode_json(&state[1..]).unwrap();
    assert_eq!(info.user_id, 1);
    assert!(info.muted);

    // Audio from a muted sender is not forwarded.
    alice
        .send(&audio_packet(&harness.suite, alice_welcome.audio_ssrc, 7))
        .await;
    bob.expect_silence().await;

    // A SPEAKING packet still relays.
    let speaking = SpeakingPayload {
        ssrc: alice_welcome.audio_ssrc,
        speaking: true,
    };
    let packet = control::encode_json(PacketType::Speaking, &speaking).unwrap();
    alice.send(&packet).await;

    let relayed = bob.recv_type(PacketType::Speaking).await;
    let payload: SpeakingPayload = control::decode_json(&relayed[1..]).unwrap();
    assert_eq!(payload.ssrc, alice_welcome.audio_ssrc);
    assert!(payload.speaking);
}

#[tokio::test]
async fn nack_replays_exactly_the_requested_cached_sequences() {
    let harness = start_server(None).await;

    let alice = Client::connect(harness.addr).await;
    let alice_welcome = alice.join(&harness, 1, 30, false).await;
    let bob = Client::connect(harness.addr).await;
    bob.join(&harness, 2, 30, false).await;

    let mut originals = std::collections::HashMap::new();
    for seq in 100..=110u16 {
        let packet = audio_packet(&harness.suite, alice_welcome.audio_ssrc, seq);
        originals.insert(seq, packet.clone());
        alice.send(&packet).await;
        let _ = bob.recv_type(PacketType::Audio).await;
    }

    let nack = Nack {
        ssrc: alice_welcome.audio_ssrc,
        sequences: vec![103, 105],
    };
    bob.send(&nack.encode()).await;

    let first = bob.recv_type(PacketType::Audio).await;
    let second = bob.recv_type(PacketType::Audio).await;
    assert_eq!(first, originals[&103]);
    assert_eq!(second, originals[&105]);
    bob.expect_silence().await;
}

#[tokio::test]
async fn second_hello_evicts_old_session_before_new_welcome() {
    let harness = start_server(None).await;

    let alice = Client::connect(harness.addr).await;
    let old_welcome = alice.join(&harness, 1, 40, false).await;
    let bob = Client::connect(harness.addr).await;
    bob.join(&harness, 2, 40, false).await;

    // Alice reconnects with a fresh client.
    let alice2 = Client::connect(harness.addr).await;
    let new_welcome = alice2.join(&harness, 1, 40, false).await;
    assert_ne!(new_welcome.session_id, old_welcome.session_id);
    assert_ne!(new_welcome.audio_ssrc, old_welcome.audio_ssrc);
    // Bob is the only other participant Alice's new session sees.
    assert_eq!(new_welcome.participants.len(), 1);
    assert_eq!(new_welcome.participants[0].user_id, 2);

    // Bob sees the old session leave, then the new one join.
    let left = bob.recv_type(PacketType::ParticipantLeft).await;
    let left: ParticipantLeftPayload = control::decode_json(&left[1..]).unwrap();
    assert_eq!(left.user_id, 1);
    assert_eq!(left.session_id, old_welcome.session_id);

    let joined = bob.recv_type(PacketType::MediaState).await;
    let joined: ParticipantInfo = control::decode_json(&joined[1..]).unwrap();
    assert_eq!(joined.user_id, 1);
    assert_eq!(joined.audio_ssrc, new_welcome.audio_ssrc);

    assert_eq!(harness.server.session_count().await, 2);
}

#[tokio::test]
async fn nat_rebinding_redirects_fanout_and_pings() {
    let harness = start_server(None).await;

    let alice = Client::connect(harness.addr).await;
    let alice_welcome = alice.join(&harness, 1, 50, false).await;
    let bob = Client::connect(harness.addr).await;
    let bob_welcome = bob.join(&harness, 2, 50, false).await;

    // Alice's NAT mapping changes: same stream, new source socket.
    let alice_moved = Client::connect(harness.addr).await;
    let packet = audio_packet(&harness.suite, alice_welcome.audio_ssrc, 1);
    alice_moved.send(&packet).await;
    assert_eq!(bob.recv_type(PacketType::Audio).await, packet);

    // Bob's media now lands on the new address.
    let reply = audio_packet(&harness.suite, bob_welcome.audio_ssrc, 1);
    bob.send(&reply).await;
    assert_eq!(alice_moved.recv_type(PacketType::Audio).await, reply);

    // Pings from the new address are answered there too.
    let ping = [PacketType::Ping as u8, 0xAA, 0xBB, 0xCC];
    alice_moved.send(&ping).await;
    let pong = alice_moved.recv_type(PacketType::Pong).await;
    assert_eq!(&pong[1..], &ping[1..], "correlation bytes preserved");
}

#[tokio::test]
async fn bad_tokens_produce_no_reply_and_no_session() {
    let harness = start_server(None).await;
    let client = Client::connect(harness.addr).await;

    // Token signed for a different server.
    let wrong_server = mint_voice_token(1, 60, Uuid::new_v4(), SECRET, 120).unwrap();
    // Token already expired.
    let now = chrono::Utc::now().timestamp() as usize;
    let expired_claims = chorus_crypto::VoiceClaims {
        user_id: 1,
        room_id: 60,
        server_id: harness.server_id,
        aud: VOICE_AUDIENCE.to_string(),
        iat: now - 900,
        exp: now - 600,
    };
    let expired = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &expired_claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    for token in [wrong_server, expired, "garbage".to_string()] {
        let hello = HelloPayload {
            token,
            protocol_version: PROTOCOL_VERSION,
            audio_codec: "opus".to_string(),
            video_codec: None,
            video_enabled: false,
            crypto: harness.suite.to_params(),
        };
        let packet = control::encode_json(PacketType::Hello, &hello).unwrap();
        client.send(&packet).await;
        client.expect_silence().await;
    }

    assert_eq!(harness.server.session_count().await, 0);
}

#[tokio::test]
async fn idle_sessions_are_swept_and_announced_once() {
    let server_id = Uuid::new_v4();
    let mut config = SfuConfig::new(server_id, SECRET);
    config.inactivity_timeout = Duration::from_millis(200);
    config.sweep_interval = Duration::from_millis(50);
    let harness = start_server(Some(config)).await;

    let alice = Client::connect(harness.addr).await;
    alice.join(&harness, 1, 70, false).await;
    let bob = Client::connect(harness.addr).await;
    bob.join(&harness, 2, 70, false).await;

    // Bob keeps pinging so only Alice goes idle.
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    let mut left_events = 0;
    while tokio::time::Instant::now() < deadline {
        bob.send(&[PacketType::Ping as u8, 0x01]).await;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        if let Ok(Ok((len, _))) =
            timeout(Duration::from_millis(50), bob.socket.recv_from(&mut buf)).await
        {
            if buf[..len].first() == Some(&(PacketType::ParticipantLeft as u8)) {
                let payload: ParticipantLeftPayload =
                    control::decode_json(&buf[1..len]).unwrap();
                assert_eq!(payload.user_id, 1);
                left_events += 1;
            }
        }
        if left_events > 0 && harness.server.session_count().await == 1 {
            break;
        }
    }

    assert_eq!(left_events, 1, "exactly one PARTICIPANT_LEFT per sweep");
    assert_eq!(harness.server.session_count().await, 1);
}

#[tokio::test]
async fn video_session_gets_video_and_screen_ssrcs() {
    let harness = start_server(None).await;
    let client = Client::connect(harness.addr).await;
    let welcome = client.join(&harness, 1, 80, true).await;
    assert!(welcome.video_ssrc.is_some());
    assert!(welcome.screen_ssrc.is_some());
    assert_ne!(welcome.video_ssrc, Some(welcome.audio_ssrc));
}
