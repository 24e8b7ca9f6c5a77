//! Wire protocol for the chorus media plane.
//!
//! Every packet is a single UDP datagram of at most [`MAX_PACKET_SIZE`]
//! bytes whose first byte is a [`PacketType`] code. Media packets carry the
//! fixed 24-byte [`MediaHeader`] (which doubles as the AEAD associated
//! data), optionally followed by a [`FragmentHeader`] for large video
//! frames, followed by ciphertext. Control packets carry either a JSON
//! payload or a small fixed binary payload after the type byte.

pub mod control;
pub mod fragment;
pub mod packet;

pub use control::{
    Bye, CryptoParams, HelloPayload, MediaStateUpdate, Nack, ParticipantInfo,
    ParticipantLeftPayload, Pli, ReceiverReport, SpeakingPayload, SubscribePayload,
    WelcomePayload,
};
pub use fragment::{FragmentHeader, FRAGMENT_HEADER_SIZE, MAX_FRAGMENT_PAYLOAD};
pub use packet::{Codec, MediaHeader, PacketType, MEDIA_HEADER_SIZE, PROTOCOL_VERSION};

/// Maximum size of a single datagram on the wire.
pub const MAX_PACKET_SIZE: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),
    #[error("invalid codec: {0}")]
    InvalidCodec(u8),
    #[error("nonzero reserved bytes")]
    NonzeroReserved,
    #[error("invalid control payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}
