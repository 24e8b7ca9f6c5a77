use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use chorus_core::AppState;
use chorus_voice::VoiceTarget;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize, Default)]
pub struct JoinVoiceRequest {
    #[serde(default)]
    pub audio_only: bool,
}

#[derive(Deserialize)]
pub struct MediaPrefsRequest {
    pub muted: bool,
    pub video_enabled: bool,
    #[serde(default)]
    pub screen_sharing: Option<bool>,
}

async fn ensure_room_member(
    state: &AppState,
    room_id: i64,
    user_id: i64,
) -> Result<(), ApiError> {
    chorus_db::rooms::get_room(&state.db, room_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !chorus_db::rooms::is_member(&state.db, room_id, user_id).await? {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

pub async fn join_voice(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    body: Option<Json<JoinVoiceRequest>>,
) -> Result<Json<Value>, ApiError> {
    ensure_room_member(&state, room_id, auth.user_id).await?;

    let audio_only = body.map(|Json(b)| b.audio_only).unwrap_or(false);
    let assignment = state
        .voice
        .assign(VoiceTarget::Room(room_id), auth.user_id, audio_only)
        .await?;

    state.event_bus.dispatch(
        "voice_user_joined",
        json!({
            "user_id": auth.user_id.to_string(),
            "room_id": room_id.to_string(),
            "server_id": assignment.server_id.to_string(),
            "video_enabled": !audio_only,
        }),
        Some(room_id),
    );

    tracing::info!(
        user_id = auth.user_id,
        room_id,
        server_id = %assignment.server_id,
        "voice join issued"
    );

    Ok(Json(serde_json::to_value(&assignment).map_err(|e| {
        ApiError::Internal(anyhow::anyhow!(e.to_string()))
    })?))
}

pub async fn leave_voice(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    ensure_room_member(&state, room_id, auth.user_id).await?;

    state
        .voice
        .leave_voice(VoiceTarget::Room(room_id), auth.user_id)
        .await?;

    state.event_bus.dispatch(
        "voice_user_left",
        json!({
            "user_id": auth.user_id.to_string(),
            "room_id": room_id.to_string(),
        }),
        Some(room_id),
    );

    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_media_prefs(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    Json(prefs): Json<MediaPrefsRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_room_member(&state, room_id, auth.user_id).await?;

    let participant = state
        .voice
        .update_media_prefs(
            VoiceTarget::Room(room_id),
            auth.user_id,
            prefs.muted,
            prefs.video_enabled,
            prefs.screen_sharing,
        )
        .await?;

    state.event_bus.dispatch(
        "voice_state_changed",
        json!({
            "user_id": auth.user_id.to_string(),
            "room_id": room_id.to_string(),
            "muted": participant.muted,
            "video_enabled": participant.video_enabled,
            "screen_sharing": participant.screen_sharing,
        }),
        Some(room_id),
    );

    Ok(Json(json!({ "participant": participant })))
}

pub async fn get_voice_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    ensure_room_member(&state, room_id, auth.user_id).await?;

    let participants = state.voice.get_voice_participants(room_id).await;
    let server_id = state.voice.room_server(room_id).await;

    Ok(Json(json!({
        "participants": participants,
        "server_id": server_id.map(|id| id.to_string()),
    })))
}
