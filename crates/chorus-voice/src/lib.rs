//! Control-plane voice services: server selection, per-room crypto-suite
//! issuance, ephemeral token minting, registry ingest and failure-driven
//! re-assignment.

pub mod health;
pub mod registry;
pub mod service;
pub mod suite_cache;

pub use registry::{HeartbeatReport, RegisterRequest};
pub use service::{
    Assignment, CodecHint, Endpoint, VoiceError, VoiceParticipant, VoiceService, VoiceSettings,
    VoiceTarget,
};
pub use suite_cache::SuiteCache;
