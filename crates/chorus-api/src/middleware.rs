use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use chorus_core::AppState;

use crate::error::ApiError;

/// Pull a non-empty bearer credential out of the Authorization header.
/// Both extractors below share this; they differ only in what the token
/// must prove.
fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Unauthorized)
}

/// A control-plane user, resolved from a session token.
pub struct AuthUser {
    pub user_id: i64,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        chorus_core::auth::validate_token(token, &state.config.jwt_secret)
            .map(|claims| AuthUser {
                user_id: claims.sub,
            })
            .map_err(|_| ApiError::Unauthorized)
    }
}

/// Registry RPCs come from the SFU fleet, which holds the shared voice
/// secret instead of a user session.
pub struct RegistryAuth;

impl FromRequestParts<AppState> for RegistryAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        if token != state.config.voice_token_secret {
            return Err(ApiError::Unauthorized);
        }
        Ok(RegistryAuth)
    }
}
