pub mod auth;
pub mod events;

use std::sync::Arc;

use chorus_db::DbPool;
use chorus_voice::VoiceService;
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Secret for user session tokens.
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Secret the voice-token signer and the SFU fleet share. Also
    /// authenticates registry RPCs.
    pub voice_token_secret: String,
    pub database_url: String,
}

/// Shared state for the control-plane HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub event_bus: events::EventBus,
    pub voice: Arc<VoiceService>,
    pub config: AppConfig,
    pub shutdown: Arc<Notify>,
}
