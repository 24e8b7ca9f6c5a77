use std::fs;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use chorus_crypto::AeadKind;
use chorus_voice::VoiceSettings;

/// Control-plane configuration. Precedence: CLI overrides > environment >
/// config file > defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Shared with the SFU fleet; signs voice tokens and authenticates
    /// registry RPCs.
    pub voice_token_secret: String,
    pub db_max_connections: u32,
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub token_ttl_secs: u64,
    pub liveness_window_secs: u64,
    pub suite_ttl_secs: u64,
    pub selection_ttl_secs: u64,
    pub health_check_interval_secs: u64,
    /// "aes256-gcm" or "chacha20-poly1305".
    pub default_aead: String,
    pub suite_cache_enabled: bool,
    pub snowflake_worker_id: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://chorus.db".to_string(),
            jwt_secret: "change-me".to_string(),
            jwt_expiry_seconds: 24 * 3600,
            voice_token_secret: "change-me-too".to_string(),
            db_max_connections: 8,
            voice: VoiceConfig::default(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 300,
            liveness_window_secs: 120,
            suite_ttl_secs: 24 * 3600,
            selection_ttl_secs: 60,
            health_check_interval_secs: 30,
            default_aead: "aes256-gcm".to_string(),
            suite_cache_enabled: true,
            snowflake_worker_id: 1,
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {path}"))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file: {path}"))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_trimmed("CHORUS_BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Some(value) = env_trimmed("CHORUS_DATABASE_URL") {
            self.database_url = value;
        }
        if let Some(value) = env_trimmed("CHORUS_JWT_SECRET") {
            self.jwt_secret = value;
        }
        if let Some(value) = env_trimmed("CHORUS_VOICE_SECRET") {
            self.voice_token_secret = value;
        }
    }

    pub fn voice_settings(&self) -> anyhow::Result<VoiceSettings> {
        let aead = AeadKind::parse(&self.voice.default_aead)
            .map_err(|e| anyhow::anyhow!("invalid voice.default_aead: {e}"))?;
        let mut settings = VoiceSettings::new(self.voice_token_secret.clone());
        settings.token_ttl_secs = self.voice.token_ttl_secs;
        settings.liveness_window = Duration::from_secs(self.voice.liveness_window_secs);
        settings.suite_ttl = Duration::from_secs(self.voice.suite_ttl_secs);
        settings.selection_ttl = Duration::from_secs(self.voice.selection_ttl_secs);
        settings.default_aead = aead;
        settings.suite_cache_enabled = self.voice.suite_cache_enabled;
        settings.worker_id = self.voice.snowflake_worker_id;
        Ok(settings)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.voice.health_check_interval_secs.max(1))
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.voice.token_ttl_secs, 300);
        assert_eq!(config.voice.liveness_window_secs, 120);
        assert!(config.voice.suite_cache_enabled);
        config.voice_settings().unwrap();
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:9000"

            [voice]
            default_aead = "chacha20-poly1305"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.voice.token_ttl_secs, 300);
        let settings = config.voice_settings().unwrap();
        assert_eq!(settings.default_aead, AeadKind::XChaCha20Poly1305);
    }

    #[test]
    fn bad_aead_name_is_rejected() {
        let mut config = ServerConfig::default();
        config.voice.default_aead = "rot13".to_string();
        assert!(config.voice_settings().is_err());
    }
}
