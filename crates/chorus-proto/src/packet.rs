use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::ProtocolError;

/// First byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x01,
    Welcome = 0x02,
    Audio = 0x03,
    Video = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Bye = 0x07,
    Speaking = 0x08,
    MediaState = 0x09,
    Nack = 0x0a,
    Pli = 0x0b,
    ReceiverReport = 0x0c,
    ParticipantLeft = 0x0d,
    Subscribe = 0x0e,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Hello),
            0x02 => Ok(PacketType::Welcome),
            0x03 => Ok(PacketType::Audio),
            0x04 => Ok(PacketType::Video),
            0x05 => Ok(PacketType::Ping),
            0x06 => Ok(PacketType::Pong),
            0x07 => Ok(PacketType::Bye),
            0x08 => Ok(PacketType::Speaking),
            0x09 => Ok(PacketType::MediaState),
            0x0a => Ok(PacketType::Nack),
            0x0b => Ok(PacketType::Pli),
            0x0c => Ok(PacketType::ReceiverReport),
            0x0d => Ok(PacketType::ParticipantLeft),
            0x0e => Ok(PacketType::Subscribe),
            other => Err(ProtocolError::InvalidPacketType(other)),
        }
    }
}

impl PacketType {
    pub fn is_media(self) -> bool {
        matches!(self, PacketType::Audio | PacketType::Video)
    }
}

/// Media payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    Opus = 1,
    H264 = 2,
    Vp8 = 3,
}

impl TryFrom<u8> for Codec {
    type Error = ProtocolError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Codec::Opus),
            2 => Ok(Codec::H264),
            3 => Ok(Codec::Vp8),
            other => Err(ProtocolError::InvalidCodec(other)),
        }
    }
}

pub const MEDIA_HEADER_SIZE: usize = 24;
pub const PROTOCOL_VERSION: u8 = 1;

/// Flag bits carried in byte 1 of the media header.
pub const FLAG_MARKER: u8 = 0x01;
pub const FLAG_KEYFRAME: u8 = 0x02;
pub const FLAG_MUTED: u8 = 0x04;
pub const FLAG_SPEAKING: u8 = 0x08;

/// 24-byte media packet header.
///
/// ```text
/// Byte 0:      Packet type (0x03 audio / 0x04 video)
/// Byte 1:      Flags [bit0 marker][bit1 keyframe][bit2 muted][bit3 speaking]
/// Byte 2:      Key id (active crypto-suite generation)
/// Byte 3:      Codec (1=opus, 2=h264, 3=vp8)
/// Bytes 4-5:   Sequence number (u16, wraps)
/// Bytes 6-9:   Timestamp (u32, codec clock)
/// Bytes 10-13: SSRC (u32, routing key)
/// Bytes 14-21: Counter (u64, monotonic, nonce input)
/// Bytes 22-23: Reserved, must be zero
/// ```
///
/// These 24 bytes are the AEAD associated data; the SFU reads them in the
/// clear and never touches the ciphertext that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub key_id: u8,
    pub codec: Codec,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub counter: u64,
}

impl MediaHeader {
    pub fn new(packet_type: PacketType, codec: Codec, ssrc: u32) -> Self {
        Self {
            packet_type,
            flags: 0,
            key_id: 0,
            codec,
            sequence: 0,
            timestamp: 0,
            ssrc,
            counter: 0,
        }
    }

    pub fn marker(&self) -> bool {
        self.flags & FLAG_MARKER != 0
    }

    pub fn keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    pub fn muted(&self) -> bool {
        self.flags & FLAG_MUTED != 0
    }

    pub fn speaking(&self) -> bool {
        self.flags & FLAG_SPEAKING != 0
    }

    /// Serialize the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags);
        buf.put_u8(self.key_id);
        buf.put_u8(self.codec as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.counter);
        buf.put_u16(0); // reserved
    }

    /// Deserialize a header from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < MEDIA_HEADER_SIZE {
            return Err(ProtocolError::BufferTooShort {
                expected: MEDIA_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }

        let packet_type = PacketType::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let key_id = buf.get_u8();
        let codec = Codec::try_from(buf.get_u8())?;
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();
        let counter = buf.get_u64();
        let reserved = buf.get_u16();
        if reserved != 0 {
            return Err(ProtocolError::NonzeroReserved);
        }

        Ok(Self {
            packet_type,
            flags,
            key_id,
            codec,
            sequence,
            timestamp,
            ssrc,
            counter,
        })
    }

    /// Encode the header into a new `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MEDIA_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for MediaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MediaHeader({:?}, flags={:#04x}, key_id={}, {:?}, seq={}, ts={}, ssrc={:#x}, ctr={})",
            self.packet_type, self.flags, self.key_id, self.codec,
            self.sequence, self.timestamp, self.ssrc, self.counter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MediaHeader {
            packet_type: PacketType::Audio,
            flags: FLAG_MARKER | FLAG_SPEAKING,
            key_id: 7,
            codec: Codec::Opus,
            sequence: 1234,
            timestamp: 567_890,
            ssrc: 0xDEADBEEF,
            counter: u64::MAX - 5,
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), MEDIA_HEADER_SIZE);

        let decoded = MediaHeader::decode(&mut bytes.as_ref()).unwrap();
        assert_eq!(header, decoded);
        assert!(decoded.marker());
        assert!(decoded.speaking());
        assert!(!decoded.muted());
        assert!(!decoded.keyframe());
    }

    #[test]
    fn video_header_round_trip() {
        let header = MediaHeader {
            packet_type: PacketType::Video,
            flags: FLAG_KEYFRAME,
            key_id: 0,
            codec: Codec::H264,
            sequence: u16::MAX,
            timestamp: 90_000,
            ssrc: 0x12345678,
            counter: 1,
        };
        let bytes = header.to_bytes();
        let decoded = MediaHeader::decode(&mut bytes.as_ref()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn buffer_too_short() {
        let buf = vec![0x03u8; 10];
        let result = MediaHeader::decode(&mut buf.as_slice());
        assert!(matches!(result, Err(ProtocolError::BufferTooShort { .. })));
    }

    #[test]
    fn nonzero_reserved_rejected() {
        let header = MediaHeader::new(PacketType::Audio, Codec::Opus, 1);
        let mut bytes = header.to_bytes().to_vec();
        bytes[23] = 1;
        let result = MediaHeader::decode(&mut bytes.as_slice());
        assert!(matches!(result, Err(ProtocolError::NonzeroReserved)));
    }

    #[test]
    fn all_type_codes_decode() {
        for code in 0x01..=0x0e {
            assert!(PacketType::try_from(code).is_ok(), "code {code:#04x}");
        }
        assert!(PacketType::try_from(0x00).is_err());
        assert!(PacketType::try_from(0x0f).is_err());
    }

    #[test]
    fn unknown_codec_rejected() {
        let mut bytes = MediaHeader::new(PacketType::Audio, Codec::Opus, 1)
            .to_bytes()
            .to_vec();
        bytes[3] = 9;
        assert!(matches!(
            MediaHeader::decode(&mut bytes.as_slice()),
            Err(ProtocolError::InvalidCodec(9))
        ));
    }
}
