use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use chorus_crypto::{mint_voice_token, AeadKind, TokenError};
use chorus_db::{dm_calls, rooms, voice_servers, DbError, DbPool};
use chorus_proto::CryptoParams;
use chorus_util::snowflake;

use crate::suite_cache::SuiteCache;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("no live voice server available")]
    NoServerAvailable,
    #[error("room not found")]
    RoomNotFound,
    #[error("user is not in voice")]
    NotInVoice,
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// What a join targets: a room, or a DM channel hosting a call. Both draw
/// ids from the same snowflake namespace, so the media plane and the suite
/// cache index them through one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTarget {
    Room(i64),
    DmChannel(i64),
}

impl VoiceTarget {
    pub fn key(self) -> i64 {
        match self {
            Self::Room(id) | Self::DmChannel(id) => id,
        }
    }

    pub fn is_dm(self) -> bool {
        matches!(self, Self::DmChannel(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceParticipant {
    pub user_id: i64,
    pub joined_at: DateTime<Utc>,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodecHint {
    pub audio: String,
    pub video: String,
}

/// Everything a client needs to reach its media server.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub server_id: Uuid,
    pub endpoint: Endpoint,
    pub voice_token: String,
    pub codec_hint: CodecHint,
    pub crypto: CryptoParams,
    pub participants: Vec<VoiceParticipant>,
}

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// Shared secret voice tokens are HMAC-signed with.
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Servers without a heartbeat within this window are dead to selection.
    pub liveness_window: Duration,
    pub suite_ttl: Duration,
    pub selection_ttl: Duration,
    pub default_aead: AeadKind,
    pub suite_cache_enabled: bool,
    pub worker_id: u16,
}

impl VoiceSettings {
    pub fn new(token_secret: impl Into<String>) -> Self {
        Self {
            token_secret: token_secret.into(),
            token_ttl_secs: 300,
            liveness_window: Duration::from_secs(120),
            suite_ttl: Duration::from_secs(24 * 3600),
            selection_ttl: Duration::from_secs(60),
            default_aead: AeadKind::Aes256Gcm,
            suite_cache_enabled: true,
            worker_id: 1,
        }
    }
}

pub(crate) struct RoomVoiceState {
    pub(crate) server_id: Uuid,
    pub(crate) participants: HashMap<i64, VoiceParticipant>,
}

/// The voice-assignment service: picks servers, issues ephemeral tokens and
/// per-room crypto suites, and tracks who is in voice where.
pub struct VoiceService {
    pub(crate) db: DbPool,
    pub(crate) settings: VoiceSettings,
    pub(crate) suites: SuiteCache,
    pub(crate) selection: moka::future::Cache<String, Uuid>,
    pub(crate) rooms: RwLock<HashMap<i64, RoomVoiceState>>,
}

impl VoiceService {
    pub fn new(db: DbPool, settings: VoiceSettings) -> Self {
        let suites = SuiteCache::new(
            settings.suite_ttl,
            settings.default_aead,
            settings.suite_cache_enabled,
        );
        let selection = moka::future::Cache::builder()
            .max_capacity(1_024)
            .time_to_live(settings.selection_ttl)
            .build();
        Self {
            db,
            settings,
            suites,
            selection,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    fn is_live(&self, row: &voice_servers::VoiceServerRow) -> bool {
        if row.status != voice_servers::STATUS_ONLINE {
            return false;
        }
        let Ok(updated_at) = row.updated_at_utc() else {
            return false;
        };
        let window = chrono::Duration::from_std(self.settings.liveness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        updated_at >= Utc::now() - window
    }

    /// Lowest-load live server, deterministic id tie-break, memoized per
    /// region for the selection TTL.
    pub async fn select_best(&self, region: Option<&str>) -> Result<Uuid, VoiceError> {
        let cache_key = region.unwrap_or("").to_string();
        if let Some(id) = self.selection.get(&cache_key).await {
            return Ok(id);
        }

        let window = chrono::Duration::from_std(self.settings.liveness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let rows = voice_servers::list_selectable(&self.db, region, Utc::now() - window).await?;
        let best = rows.first().ok_or(VoiceError::NoServerAvailable)?;
        let id = best.id_uuid().map_err(|_| VoiceError::NoServerAvailable)?;

        self.selection.insert(cache_key, id).await;
        Ok(id)
    }

    /// Assign a user to a voice server for a room or DM call.
    ///
    /// Reuses the pinned server when it is live; otherwise selects a fresh
    /// one, migrates the room's in-memory participants and invalidates the
    /// room's crypto suite so the next generation is minted under the new
    /// server.
    pub async fn assign(
        &self,
        target: VoiceTarget,
        user_id: i64,
        audio_only: bool,
    ) -> Result<Assignment, VoiceError> {
        let key = target.key();

        let pinned: Option<String> = match target {
            VoiceTarget::Room(id) => rooms::get_room(&self.db, id)
                .await?
                .ok_or(VoiceError::RoomNotFound)?
                .voice_server_id,
            VoiceTarget::DmChannel(id) => {
                dm_calls::get_dm_channel(&self.db, id)
                    .await?
                    .ok_or(VoiceError::RoomNotFound)?;
                dm_calls::get_active_call(&self.db, id)
                    .await?
                    .and_then(|call| call.voice_server_id)
            }
        };

        let pinned_row = match &pinned {
            Some(id) => voice_servers::get_server(&self.db, id).await?,
            None => None,
        };

        let mut rebound = false;
        let server = match pinned_row {
            Some(row) if self.is_live(&row) => row,
            stale => {
                let region = stale.as_ref().map(|row| row.region.clone());
                let replacement = self.select_best(region.as_deref()).await?;
                let row = voice_servers::get_server(&self.db, &replacement.to_string())
                    .await?
                    .ok_or(VoiceError::NoServerAvailable)?;
                if pinned.is_some() {
                    rebound = true;
                    info!(
                        room_id = key,
                        old_server = pinned.as_deref().unwrap_or(""),
                        new_server = %row.id,
                        "pinned voice server is not live, rebinding room"
                    );
                }
                row
            }
        };
        let server_id = server.id_uuid().map_err(|_| VoiceError::NoServerAvailable)?;

        // A rebind orphans every suite issued under the old server.
        if rebound {
            self.suites.invalidate(key).await;
        }

        if let VoiceTarget::Room(id) = target {
            if rebound || pinned.is_none() {
                rooms::set_voice_server(&self.db, id, Some(&server.id)).await?;
            }
        }

        let voice_token = mint_voice_token(
            user_id,
            key,
            server_id,
            &self.settings.token_secret,
            self.settings.token_ttl_secs,
        )?;

        let suite = self.suites.get_or_create(key).await;

        let participant = VoiceParticipant {
            user_id,
            joined_at: Utc::now(),
            muted: false,
            video_enabled: !audio_only,
            screen_sharing: false,
        };
        let participants: Vec<VoiceParticipant> = {
            let mut rooms_map = self.rooms.write().await;
            let state = rooms_map.entry(key).or_insert_with(|| RoomVoiceState {
                server_id,
                participants: HashMap::new(),
            });
            state.server_id = server_id;
            state.participants.insert(user_id, participant);
            state
                .participants
                .values()
                .filter(|p| p.user_id != user_id)
                .cloned()
                .collect()
        };

        if let VoiceTarget::DmChannel(channel_id) = target {
            let call = dm_calls::start_call(
                &self.db,
                snowflake::generate(self.settings.worker_id),
                channel_id,
                user_id,
                &server.id,
            )
            .await?;
            if call.voice_server_id.as_deref() != Some(server.id.as_str()) {
                dm_calls::set_voice_server(&self.db, channel_id, &server.id).await?;
            }
        }

        info!(
            room_id = key,
            user_id,
            server = %server.id,
            rebound,
            "voice assignment issued"
        );

        Ok(Assignment {
            server_id,
            endpoint: Endpoint {
                host: server.udp_host.clone(),
                port: server.udp_port as u16,
            },
            voice_token,
            codec_hint: CodecHint {
                audio: "opus".to_string(),
                video: "h264".to_string(),
            },
            crypto: suite.to_params(),
            participants,
        })
    }

    /// Remove a user from a room's voice; returns the remaining
    /// participants. The last leaver of a DM call ends the call row.
    pub async fn leave_voice(
        &self,
        target: VoiceTarget,
        user_id: i64,
    ) -> Result<Vec<VoiceParticipant>, VoiceError> {
        let key = target.key();

        let mut rooms_map = self.rooms.write().await;
        let mut emptied = false;
        let remaining: Vec<VoiceParticipant> = match rooms_map.get_mut(&key) {
            Some(state) => {
                state.participants.remove(&user_id);
                emptied = state.participants.is_empty();
                state.participants.values().cloned().collect()
            }
            None => Vec::new(),
        };
        if emptied {
            rooms_map.remove(&key);
        }
        drop(rooms_map);

        if remaining.is_empty() && target.is_dm() {
            dm_calls::end_call(&self.db, key).await?;
        }

        Ok(remaining)
    }

    /// Update a participant's media preferences. Broadcasting the change is
    /// the caller's job (via the event hub).
    pub async fn update_media_prefs(
        &self,
        target: VoiceTarget,
        user_id: i64,
        muted: bool,
        video_enabled: bool,
        screen_sharing: Option<bool>,
    ) -> Result<VoiceParticipant, VoiceError> {
        let mut rooms_map = self.rooms.write().await;
        let state = rooms_map
            .get_mut(&target.key())
            .ok_or(VoiceError::NotInVoice)?;
        let participant = state
            .participants
            .get_mut(&user_id)
            .ok_or(VoiceError::NotInVoice)?;

        participant.muted = muted;
        participant.video_enabled = video_enabled;
        if let Some(screen) = screen_sharing {
            participant.screen_sharing = screen;
        }
        Ok(participant.clone())
    }

    pub async fn get_voice_participants(&self, key: i64) -> Vec<VoiceParticipant> {
        let rooms_map = self.rooms.read().await;
        rooms_map
            .get(&key)
            .map(|state| state.participants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The server a room's voice is currently homed on, if anyone is in it.
    pub async fn room_server(&self, key: i64) -> Option<Uuid> {
        let rooms_map = self.rooms.read().await;
        rooms_map.get(&key).map(|state| state.server_id)
    }

    pub async fn invalidate_suite(&self, key: i64) {
        self.suites.invalidate(key).await;
    }
}
