use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Hard ceiling on voice-token lifetime.
pub const VOICE_TOKEN_MAX_TTL_SECS: u64 = 300;

/// Audience string all voice tokens are minted for.
pub const VOICE_AUDIENCE: &str = "chorus-voice";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("wrong audience")]
    Audience,
    #[error("token not valid for this server")]
    ServerMismatch,
    #[error("invalid token")]
    Invalid,
    #[error("token signing failed")]
    Signing,
}

/// Claims of an ephemeral voice token carried in HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceClaims {
    pub user_id: i64,
    pub room_id: i64,
    pub server_id: Uuid,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
}

/// Mint an HMAC-signed voice token. The lifetime is clamped to
/// [`VOICE_TOKEN_MAX_TTL_SECS`].
pub fn mint_voice_token(
    user_id: i64,
    room_id: i64,
    server_id: Uuid,
    secret: &str,
    ttl_secs: u64,
) -> Result<String, TokenError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let ttl = ttl_secs.min(VOICE_TOKEN_MAX_TTL_SECS) as usize;
    let claims = VoiceClaims {
        user_id,
        room_id,
        server_id,
        aud: VOICE_AUDIENCE.to_string(),
        iat: now,
        exp: now + ttl,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| TokenError::Signing)
}

/// Stateless verifier pinned to a single media server.
pub struct VoiceTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    server_id: Uuid,
}

impl VoiceTokenVerifier {
    pub fn new(secret: &str, server_id: Uuid) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_audience(&[VOICE_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            server_id,
        }
    }

    pub fn verify(&self, token: &str) -> Result<VoiceClaims, TokenError> {
        let data =
            decode::<VoiceClaims>(token, &self.decoding_key, &self.validation).map_err(|err| {
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                    jsonwebtoken::errors::ErrorKind::InvalidAudience => TokenError::Audience,
                    _ => TokenError::Invalid,
                }
            })?;

        if data.claims.server_id != self.server_id {
            return Err(TokenError::ServerMismatch);
        }
        Ok(data.claims)
    }
}
