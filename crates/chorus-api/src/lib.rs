pub mod error;
pub mod middleware;
pub mod routes;

use axum::{
    routing::{get, patch, post},
    Router,
};
use chorus_core::AppState;

async fn health() -> &'static str {
    "ok"
}

/// Build the control-plane router. State is applied by the caller.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Room voice
        .route("/api/rooms/{room_id}/voice/join", post(routes::voice::join_voice))
        .route("/api/rooms/{room_id}/voice/leave", post(routes::voice::leave_voice))
        .route("/api/rooms/{room_id}/voice/prefs", patch(routes::voice::set_media_prefs))
        .route("/api/rooms/{room_id}/voice", get(routes::voice::get_voice_status))
        // DM calls
        .route("/api/dms/{channel_id}/call/join", post(routes::dm_calls::join_dm_call))
        .route("/api/dms/{channel_id}/call/leave", post(routes::dm_calls::leave_dm_call))
        // Registry RPC (SFU fleet)
        .route(
            "/api/voice/servers",
            post(routes::registry::register_server).get(routes::registry::list_servers),
        )
        .route(
            "/api/voice/servers/{server_id}/heartbeat",
            post(routes::registry::heartbeat),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
