use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chorus_db::{voice_servers, DbError, DbPool};

/// Registry RPC: idempotent server registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub region: String,
    pub udp_host: String,
    pub udp_port: u16,
    pub ctrl_url: String,
    #[serde(default)]
    pub capacity_hint: i64,
}

/// Registry RPC: periodic liveness + load report from a media server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub server_id: Uuid,
    pub active_rooms: u64,
    pub active_sessions: u64,
    /// CPU utilisation in 0..1.
    pub cpu: f64,
    pub outbound_mbps: f64,
}

/// Lower is better. CPU dominates, with session count and outbound
/// bandwidth as tie-breakers.
pub fn load_score(report: &HeartbeatReport) -> f64 {
    report.cpu * 100.0 + report.outbound_mbps + report.active_sessions as f64
}

pub async fn register(
    pool: &DbPool,
    request: &RegisterRequest,
) -> Result<voice_servers::VoiceServerRow, DbError> {
    voice_servers::register_server(
        pool,
        &request.name,
        &request.region,
        &request.udp_host,
        request.udp_port,
        &request.ctrl_url,
        request.capacity_hint,
    )
    .await
}

pub async fn apply_heartbeat(pool: &DbPool, report: &HeartbeatReport) -> Result<(), DbError> {
    voice_servers::heartbeat(pool, &report.server_id.to_string(), load_score(report)).await
}
