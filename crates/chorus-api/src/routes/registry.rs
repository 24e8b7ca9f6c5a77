use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use chorus_core::AppState;
use chorus_voice::registry::{self, HeartbeatReport, RegisterRequest};

use crate::error::ApiError;
use crate::middleware::RegistryAuth;

#[derive(Deserialize, Default)]
pub struct ListServersQuery {
    pub region: Option<String>,
}

pub async fn register_server(
    State(state): State<AppState>,
    _auth: RegistryAuth,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("server name must not be empty".into()));
    }

    let row = registry::register(&state.db, &request).await?;
    tracing::info!(
        server_id = %row.id,
        name = %row.name,
        region = %row.region,
        "voice server registered"
    );

    Ok(Json(json!({
        "id": row.id,
        "name": row.name,
        "region": row.region,
        "udp_host": row.udp_host,
        "udp_port": row.udp_port,
        "ctrl_url": row.ctrl_url,
        "status": row.status,
    })))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    _auth: RegistryAuth,
    Path(server_id): Path<Uuid>,
    Json(mut report): Json<HeartbeatReport>,
) -> Result<StatusCode, ApiError> {
    report.server_id = server_id;
    registry::apply_heartbeat(&state.db, &report).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_servers(
    State(state): State<AppState>,
    _auth: RegistryAuth,
    Query(query): Query<ListServersQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = chorus_db::voice_servers::list_servers(&state.db, query.region.as_deref()).await?;
    let servers: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "name": row.name,
                "region": row.region,
                "udp_host": row.udp_host,
                "udp_port": row.udp_port,
                "status": row.status,
                "load_score": row.load_score,
                "updated_at": row.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "servers": servers })))
}
