use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chorus_db::{dm_calls, rooms, voice_servers};

use crate::service::{VoiceError, VoiceService};

/// Spawn the periodic health checker. Each cycle re-homes every room pinned
/// to a server that has missed its heartbeats.
pub fn start_health_checker(service: Arc<VoiceService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_health_check(&service).await {
                warn!(error = %e, "voice health check cycle failed");
            }
        }
    })
}

/// One health-check cycle: find servers whose `updated_at` is older than
/// the liveness window, mark them offline, and for every affected room pick
/// a replacement, rewrite the pins and invalidate the crypto suite.
pub async fn run_health_check(service: &VoiceService) -> Result<(), VoiceError> {
    let window = chrono::Duration::from_std(service.settings.liveness_window)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));
    let stale = voice_servers::list_stale_online(&service.db, Utc::now() - window).await?;

    for server in stale {
        warn!(
            server_id = %server.id,
            name = %server.name,
            region = %server.region,
            "voice server missed heartbeats, re-homing its rooms"
        );
        voice_servers::set_status(&service.db, &server.id, voice_servers::STATUS_OFFLINE).await?;
        // The dead server may be memoized for its region.
        service.selection.invalidate_all();

        let pinned_rooms = rooms::rooms_pinned_to(&service.db, &server.id).await?;
        let pinned_calls = dm_calls::calls_pinned_to(&service.db, &server.id).await?;

        let mut affected: HashSet<i64> = pinned_rooms.iter().map(|r| r.id).collect();
        affected.extend(pinned_calls.iter().map(|c| c.channel_id));
        if let Ok(dead_id) = server.id_uuid() {
            let rooms_map = service.rooms.read().await;
            affected.extend(
                rooms_map
                    .iter()
                    .filter(|(_, state)| state.server_id == dead_id)
                    .map(|(key, _)| *key),
            );
        }

        if affected.is_empty() {
            continue;
        }

        let replacement = match service.select_best(Some(&server.region)).await {
            Ok(id) => Some(id),
            Err(VoiceError::NoServerAvailable) => service.select_best(None).await.ok(),
            Err(e) => return Err(e),
        };

        for key in affected {
            service.suites.invalidate(key).await;

            match replacement {
                Some(new_id) => {
                    let new_id_text = new_id.to_string();
                    if pinned_rooms.iter().any(|r| r.id == key) {
                        rooms::set_voice_server(&service.db, key, Some(&new_id_text)).await?;
                    }
                    if pinned_calls.iter().any(|c| c.channel_id == key) {
                        dm_calls::set_voice_server(&service.db, key, &new_id_text).await?;
                    }
                    let mut rooms_map = service.rooms.write().await;
                    if let Some(state) = rooms_map.get_mut(&key) {
                        state.server_id = new_id;
                    }
                    info!(room_id = key, new_server = %new_id, "voice room re-homed");
                }
                None => {
                    if pinned_rooms.iter().any(|r| r.id == key) {
                        rooms::set_voice_server(&service.db, key, None).await?;
                    }
                    warn!(room_id = key, "no live replacement server, room unpinned");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{VoiceSettings, VoiceTarget};
    use chorus_db::{create_pool, run_migrations};
    use chorus_util::snowflake;

    async fn service() -> Arc<VoiceService> {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool, "sqlite::memory:")
            .await
            .expect("migrations");
        Arc::new(VoiceService::new(pool, VoiceSettings::new("health-secret")))
    }

    async fn add_server(svc: &VoiceService, name: &str) -> String {
        voice_servers::register_server(&svc.db, name, "eu", "10.0.0.1", 5000, "http://ctrl", 100)
            .await
            .unwrap()
            .id
    }

    async fn backdate_heartbeat(svc: &VoiceService, id: &str, seconds: i64) {
        let stale = (Utc::now() - chrono::Duration::seconds(seconds))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        sqlx::query("UPDATE voice_servers SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(stale)
            .execute(&svc.db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dead_server_rooms_are_rehomed_and_suites_rotated() {
        let svc = service().await;
        let server_a = add_server(&svc, "sfu-a").await;
        let room_id = snowflake::generate(1);
        rooms::create_room(&svc.db, room_id, "general").await.unwrap();

        let before = svc.assign(VoiceTarget::Room(room_id), 1, false).await.unwrap();
        assert_eq!(before.server_id.to_string(), server_a);

        // A goes silent; B is the live replacement.
        backdate_heartbeat(&svc, &server_a, 600).await;
        let server_b = add_server(&svc, "sfu-b").await;

        run_health_check(&svc).await.unwrap();

        let a_row = voice_servers::get_server(&svc.db, &server_a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a_row.status, voice_servers::STATUS_OFFLINE);

        let room = rooms::get_room(&svc.db, room_id).await.unwrap().unwrap();
        assert_eq!(room.voice_server_id.as_deref(), Some(server_b.as_str()));
        assert_eq!(
            svc.room_server(room_id).await.map(|id| id.to_string()),
            Some(server_b.clone())
        );

        // The suite rotated, so the next join gets a fresh generation on B.
        let after = svc.assign(VoiceTarget::Room(room_id), 2, false).await.unwrap();
        assert_eq!(after.server_id.to_string(), server_b);
        assert_ne!(before.crypto.key_material, after.crypto.key_material);
    }

    #[tokio::test]
    async fn dead_dm_call_servers_are_rehomed() {
        let svc = service().await;
        let server_a = add_server(&svc, "sfu-a").await;
        let channel_id = snowflake::generate(1);
        dm_calls::create_dm_channel(&svc.db, channel_id, 1, 2).await.unwrap();
        svc.assign(VoiceTarget::DmChannel(channel_id), 1, true)
            .await
            .unwrap();

        backdate_heartbeat(&svc, &server_a, 600).await;
        let server_b = add_server(&svc, "sfu-b").await;

        run_health_check(&svc).await.unwrap();

        let call = dm_calls::get_active_call(&svc.db, channel_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.voice_server_id.as_deref(), Some(server_b.as_str()));
    }

    #[tokio::test]
    async fn no_replacement_unpins_the_room() {
        let svc = service().await;
        let server_a = add_server(&svc, "sfu-a").await;
        let room_id = snowflake::generate(1);
        rooms::create_room(&svc.db, room_id, "general").await.unwrap();
        svc.assign(VoiceTarget::Room(room_id), 1, false).await.unwrap();

        backdate_heartbeat(&svc, &server_a, 600).await;
        run_health_check(&svc).await.unwrap();

        let room = rooms::get_room(&svc.db, room_id).await.unwrap().unwrap();
        assert!(room.voice_server_id.is_none());
    }
}
