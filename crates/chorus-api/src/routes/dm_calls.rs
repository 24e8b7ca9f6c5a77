use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use chorus_core::AppState;
use chorus_voice::VoiceTarget;

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::routes::voice::JoinVoiceRequest;

async fn dm_peers(
    state: &AppState,
    channel_id: i64,
    user_id: i64,
) -> Result<Vec<i64>, ApiError> {
    let channel = chorus_db::dm_calls::get_dm_channel(&state.db, channel_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if channel.user_a != user_id && channel.user_b != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(vec![channel.user_a, channel.user_b])
}

pub async fn join_dm_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<i64>,
    body: Option<Json<JoinVoiceRequest>>,
) -> Result<Json<Value>, ApiError> {
    let peers = dm_peers(&state, channel_id, auth.user_id).await?;

    let audio_only = body.map(|Json(b)| b.audio_only).unwrap_or(false);
    let assignment = state
        .voice
        .assign(VoiceTarget::DmChannel(channel_id), auth.user_id, audio_only)
        .await?;

    state.event_bus.dispatch_to_users(
        "voice_user_joined",
        json!({
            "user_id": auth.user_id.to_string(),
            "channel_id": channel_id.to_string(),
            "server_id": assignment.server_id.to_string(),
        }),
        peers,
    );

    tracing::info!(
        user_id = auth.user_id,
        channel_id,
        server_id = %assignment.server_id,
        "dm call join issued"
    );

    Ok(Json(serde_json::to_value(&assignment).map_err(|e| {
        ApiError::Internal(anyhow::anyhow!(e.to_string()))
    })?))
}

pub async fn leave_dm_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let peers = dm_peers(&state, channel_id, auth.user_id).await?;

    state
        .voice
        .leave_voice(VoiceTarget::DmChannel(channel_id), auth.user_id)
        .await?;

    state.event_bus.dispatch_to_users(
        "voice_user_left",
        json!({
            "user_id": auth.user_id.to_string(),
            "channel_id": channel_id.to_string(),
        }),
        peers,
    );

    Ok(StatusCode::NO_CONTENT)
}
