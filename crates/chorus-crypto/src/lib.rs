//! Crypto boundary of the media plane: per-room crypto suites, per-session
//! AEAD handles, and the ephemeral voice-token contract.

pub mod aead;
pub mod suite;
pub mod token;

pub use aead::{CryptoError, SessionCrypto};
pub use suite::{AeadKind, CryptoSuite, KEY_SIZE, NONCE_BASE_SIZE};
pub use token::{
    mint_voice_token, TokenError, VoiceClaims, VoiceTokenVerifier, VOICE_AUDIENCE,
    VOICE_TOKEN_MAX_TTL_SECS,
};
