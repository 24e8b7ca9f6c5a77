use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{packet::PacketType, ProtocolError};

/// Crypto-suite parameters as they travel in HELLO payloads and join
/// responses. Key bytes are base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoParams {
    pub aead: String,
    pub key_id: String,
    pub key_material: String,
    pub nonce_base: String,
}

/// HELLO: first packet a client sends after obtaining an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub token: String,
    pub protocol_version: u8,
    pub audio_codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    pub video_enabled: bool,
    pub crypto: CryptoParams,
}

/// One participant as seen by the rest of the room. Doubles as the
/// MEDIA_STATE broadcast payload (join announcements carry the ssrcs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: i64,
    pub audio_ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_ssrc: Option<u32>,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub speaking: bool,
}

/// WELCOME: reply to an accepted HELLO. `participants` never includes the
/// new session itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: i64,
    pub audio_ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_ssrc: Option<u32>,
    pub participants: Vec<ParticipantInfo>,
}

/// MEDIA_STATE sent by a client to change its own flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaStateUpdate {
    pub muted: bool,
    pub video_enabled: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

/// SPEAKING: voice-activity signal, relayed to the room even while muted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeakingPayload {
    pub ssrc: u32,
    pub speaking: bool,
}

/// PARTICIPANT_LEFT broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParticipantLeftPayload {
    pub user_id: i64,
    pub session_id: i64,
}

/// SUBSCRIBE: replaces the sender's subscription set. An empty list means
/// "everything in the room".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub ssrcs: Vec<u32>,
}

/// Encode a JSON control packet: type byte followed by the serialized
/// payload.
pub fn encode_json<T: Serialize>(packet_type: PacketType, payload: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(payload)?;
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(packet_type as u8);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode the JSON payload of a control packet (everything after the type
/// byte).
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// BYE: 4-byte ssrc identifying the departing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bye {
    pub ssrc: u32,
}

impl Bye {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(PacketType::Bye as u8);
        buf.put_u32(self.ssrc);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(ProtocolError::BufferTooShort {
                expected: 4,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            ssrc: buf.get_u32(),
        })
    }
}

/// NACK: the requester lists sequences it is missing from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub ssrc: u32,
    pub sequences: Vec<u16>,
}

impl Nack {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7 + self.sequences.len() * 2);
        buf.put_u8(PacketType::Nack as u8);
        buf.put_u32(self.ssrc);
        buf.put_u16(self.sequences.len() as u16);
        for seq in &self.sequences {
            buf.put_u16(*seq);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < 6 {
            return Err(ProtocolError::BufferTooShort {
                expected: 6,
                actual: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let count = buf.get_u16() as usize;
        if buf.remaining() < count * 2 {
            return Err(ProtocolError::BufferTooShort {
                expected: count * 2,
                actual: buf.remaining(),
            });
        }
        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            sequences.push(buf.get_u16());
        }
        Ok(Self { ssrc, sequences })
    }
}

/// PLI: keyframe request targeting one video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub ssrc: u32,
}

impl Pli {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(PacketType::Pli as u8);
        buf.put_u32(self.ssrc);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(ProtocolError::BufferTooShort {
                expected: 4,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            ssrc: buf.get_u32(),
        })
    }
}

pub const RECEIVER_REPORT_SIZE: usize = 28;

/// RR: loss/jitter statistics for one received stream, relayed by the SFU
/// to the stream's sender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverReport {
    /// The stream being reported on.
    pub ssrc: u32,
    /// The reporter's own audio ssrc.
    pub reporter_ssrc: u32,
    /// Fraction of packets lost since the last report, 0..1.
    pub fraction_lost: f32,
    pub total_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
}

impl ReceiverReport {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + RECEIVER_REPORT_SIZE);
        buf.put_u8(PacketType::ReceiverReport as u8);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.reporter_ssrc);
        buf.put_f32(self.fraction_lost);
        buf.put_u32(self.total_lost);
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < RECEIVER_REPORT_SIZE {
            return Err(ProtocolError::BufferTooShort {
                expected: RECEIVER_REPORT_SIZE,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            ssrc: buf.get_u32(),
            reporter_ssrc: buf.get_u32(),
            fraction_lost: buf.get_f32(),
            total_lost: buf.get_u32(),
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_json_round_trip() {
        let hello = HelloPayload {
            token: "tok".into(),
            protocol_version: 1,
            audio_codec: "opus".into(),
            video_codec: Some("h264".into()),
            video_enabled: true,
            crypto: CryptoParams {
                aead: "aes256-gcm".into(),
                key_id: "AAAAAQ==".into(),
                key_material: "a".repeat(44),
                nonce_base: "b".repeat(16),
            },
        };
        let packet = encode_json(PacketType::Hello, &hello).unwrap();
        assert_eq!(packet[0], PacketType::Hello as u8);
        let decoded: HelloPayload = decode_json(&packet[1..]).unwrap();
        assert_eq!(decoded.token, "tok");
        assert_eq!(decoded.crypto.aead, "aes256-gcm");
        assert!(decoded.video_enabled);
    }

    #[test]
    fn welcome_round_trip() {
        let welcome = WelcomePayload {
            session_id: 9,
            audio_ssrc: 100,
            video_ssrc: None,
            screen_ssrc: None,
            participants: vec![ParticipantInfo {
                user_id: 1,
                audio_ssrc: 50,
                video_ssrc: Some(51),
                screen_ssrc: None,
                muted: false,
                video_enabled: true,
                screen_sharing: false,
                speaking: false,
            }],
        };
        let packet = encode_json(PacketType::Welcome, &welcome).unwrap();
        let decoded: WelcomePayload = decode_json(&packet[1..]).unwrap();
        assert_eq!(decoded.participants.len(), 1);
        assert_eq!(decoded.participants[0].video_ssrc, Some(51));
    }

    #[test]
    fn nack_round_trip() {
        let nack = Nack {
            ssrc: 0xCAFEBABE,
            sequences: vec![103, 105, 65535],
        };
        let packet = nack.encode();
        assert_eq!(packet[0], PacketType::Nack as u8);
        let decoded = Nack::decode(&packet[1..]).unwrap();
        assert_eq!(decoded, nack);
    }

    #[test]
    fn nack_truncated_sequence_list_rejected() {
        let nack = Nack {
            ssrc: 1,
            sequences: vec![1, 2, 3],
        };
        let packet = nack.encode();
        // Cut off the last sequence.
        let result = Nack::decode(&packet[1..packet.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::BufferTooShort { .. })));
    }

    #[test]
    fn bye_and_pli_round_trip() {
        let bye = Bye { ssrc: 77 };
        assert_eq!(Bye::decode(&bye.encode()[1..]).unwrap(), bye);

        let pli = Pli { ssrc: 88 };
        assert_eq!(Pli::decode(&pli.encode()[1..]).unwrap(), pli);
    }

    #[test]
    fn receiver_report_round_trip() {
        let rr = ReceiverReport {
            ssrc: 10,
            reporter_ssrc: 20,
            fraction_lost: 0.25,
            total_lost: 4,
            highest_seq: 110,
            jitter: 3,
            last_sr: 0,
        };
        let packet = rr.encode();
        assert_eq!(packet.len(), 1 + RECEIVER_REPORT_SIZE);
        let decoded = ReceiverReport::decode(&packet[1..]).unwrap();
        assert_eq!(decoded, rr);
    }

    #[test]
    fn empty_subscribe_means_everything() {
        let sub = SubscribePayload { ssrcs: vec![] };
        let packet = encode_json(PacketType::Subscribe, &sub).unwrap();
        let decoded: SubscribePayload = decode_json(&packet[1..]).unwrap();
        assert!(decoded.ssrcs.is_empty());
    }
}
