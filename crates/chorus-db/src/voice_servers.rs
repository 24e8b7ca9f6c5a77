use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_DRAINING: &str = "draining";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoiceServerRow {
    pub id: String,
    pub name: String,
    pub region: String,
    pub udp_host: String,
    pub udp_port: i64,
    pub ctrl_url: String,
    pub status: String,
    pub capacity_hint: i64,
    pub load_score: f64,
    pub updated_at: String,
}

impl VoiceServerRow {
    pub fn id_uuid(&self) -> Result<Uuid, DbError> {
        Uuid::parse_str(&self.id).map_err(|_| DbError::NotFound)
    }

    pub fn updated_at_utc(&self) -> Result<DateTime<Utc>, DbError> {
        Ok(datetime_from_db_text(&self.updated_at)?)
    }
}

const ALL_COLUMNS: &str =
    "id, name, region, udp_host, udp_port, ctrl_url, status, capacity_hint, load_score, updated_at";

/// Idempotent registration keyed by server name: creates the row on first
/// call, refreshes addressing on subsequent calls.
pub async fn register_server(
    pool: &DbPool,
    name: &str,
    region: &str,
    udp_host: &str,
    udp_port: u16,
    ctrl_url: &str,
    capacity_hint: i64,
) -> Result<VoiceServerRow, DbError> {
    let now = datetime_to_db_text(Utc::now());

    let existing = sqlx::query_as::<_, VoiceServerRow>(&format!(
        "SELECT {ALL_COLUMNS} FROM voice_servers WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    let id = match existing {
        Some(row) => {
            sqlx::query(
                "UPDATE voice_servers
                 SET region = ?2, udp_host = ?3, udp_port = ?4, ctrl_url = ?5,
                     capacity_hint = ?6, status = 'online', updated_at = ?7
                 WHERE id = ?1",
            )
            .bind(&row.id)
            .bind(region)
            .bind(udp_host)
            .bind(udp_port as i64)
            .bind(ctrl_url)
            .bind(capacity_hint)
            .bind(&now)
            .execute(pool)
            .await?;
            row.id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO voice_servers
                 (id, name, region, udp_host, udp_port, ctrl_url, status, capacity_hint, load_score, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'online', ?7, 0, ?8)",
            )
            .bind(&id)
            .bind(name)
            .bind(region)
            .bind(udp_host)
            .bind(udp_port as i64)
            .bind(ctrl_url)
            .bind(capacity_hint)
            .bind(&now)
            .execute(pool)
            .await?;
            id
        }
    };

    get_server(pool, &id).await?.ok_or(DbError::NotFound)
}

pub async fn get_server(pool: &DbPool, id: &str) -> Result<Option<VoiceServerRow>, DbError> {
    let row = sqlx::query_as::<_, VoiceServerRow>(&format!(
        "SELECT {ALL_COLUMNS} FROM voice_servers WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Heartbeat upsert: marks the server online with a fresh load score.
pub async fn heartbeat(pool: &DbPool, id: &str, load_score: f64) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE voice_servers SET status = 'online', load_score = ?2, updated_at = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(load_score)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn set_status(pool: &DbPool, id: &str, status: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE voice_servers SET status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_servers(
    pool: &DbPool,
    region: Option<&str>,
) -> Result<Vec<VoiceServerRow>, DbError> {
    let rows = match region {
        Some(region) => {
            sqlx::query_as::<_, VoiceServerRow>(&format!(
                "SELECT {ALL_COLUMNS} FROM voice_servers WHERE region = ?1 ORDER BY name"
            ))
            .bind(region)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, VoiceServerRow>(&format!(
                "SELECT {ALL_COLUMNS} FROM voice_servers ORDER BY name"
            ))
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Online servers with a heartbeat at or after `cutoff`, ordered by load
/// (the fixed-width timestamp text compares correctly).
pub async fn list_selectable(
    pool: &DbPool,
    region: Option<&str>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<VoiceServerRow>, DbError> {
    let cutoff = datetime_to_db_text(cutoff);
    let rows = match region {
        Some(region) => {
            sqlx::query_as::<_, VoiceServerRow>(&format!(
                "SELECT {ALL_COLUMNS} FROM voice_servers
                 WHERE status = 'online' AND updated_at >= ?1 AND region = ?2
                 ORDER BY load_score ASC, id ASC"
            ))
            .bind(&cutoff)
            .bind(region)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, VoiceServerRow>(&format!(
                "SELECT {ALL_COLUMNS} FROM voice_servers
                 WHERE status = 'online' AND updated_at >= ?1
                 ORDER BY load_score ASC, id ASC"
            ))
            .bind(&cutoff)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Servers still marked online whose heartbeat is older than `cutoff`:
/// candidates for failure-driven re-assignment.
pub async fn list_stale_online(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<VoiceServerRow>, DbError> {
    let rows = sqlx::query_as::<_, VoiceServerRow>(&format!(
        "SELECT {ALL_COLUMNS} FROM voice_servers
         WHERE status = 'online' AND updated_at < ?1"
    ))
    .bind(datetime_to_db_text(cutoff))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn register_is_idempotent_by_name() {
        let pool = test_pool().await;
        let first = register_server(&pool, "sfu-1", "eu", "10.0.0.1", 5000, "http://sfu-1", 100)
            .await
            .unwrap();
        let second = register_server(&pool, "sfu-1", "eu", "10.0.0.2", 5001, "http://sfu-1", 100)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.udp_host, "10.0.0.2");
        assert_eq!(second.udp_port, 5001);
        assert_eq!(list_servers(&pool, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_status_and_load() {
        let pool = test_pool().await;
        let row = register_server(&pool, "sfu-1", "eu", "10.0.0.1", 5000, "http://sfu-1", 100)
            .await
            .unwrap();

        set_status(&pool, &row.id, STATUS_OFFLINE).await.unwrap();
        heartbeat(&pool, &row.id, 12.5).await.unwrap();

        let row = get_server(&pool, &row.id).await.unwrap().unwrap();
        assert_eq!(row.status, STATUS_ONLINE);
        assert_eq!(row.load_score, 12.5);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_server_is_not_found() {
        let pool = test_pool().await;
        let result = heartbeat(&pool, &Uuid::new_v4().to_string(), 1.0).await;
        assert!(matches!(result, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn selectable_excludes_stale_and_offline() {
        let pool = test_pool().await;
        let fresh = register_server(&pool, "fresh", "eu", "10.0.0.1", 5000, "http://a", 100)
            .await
            .unwrap();
        let offline = register_server(&pool, "offline", "eu", "10.0.0.2", 5000, "http://b", 100)
            .await
            .unwrap();
        set_status(&pool, &offline.id, STATUS_OFFLINE).await.unwrap();

        let stale = register_server(&pool, "stale", "eu", "10.0.0.3", 5000, "http://c", 100)
            .await
            .unwrap();
        // Backdate the stale server's heartbeat past the liveness window.
        sqlx::query("UPDATE voice_servers SET updated_at = ?2 WHERE id = ?1")
            .bind(&stale.id)
            .bind(datetime_to_db_text(Utc::now() - Duration::seconds(600)))
            .execute(&pool)
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::seconds(120);
        let selectable = list_selectable(&pool, Some("eu"), cutoff).await.unwrap();
        assert_eq!(selectable.len(), 1);
        assert_eq!(selectable[0].id, fresh.id);

        let stale_online = list_stale_online(&pool, cutoff).await.unwrap();
        assert_eq!(stale_online.len(), 1);
        assert_eq!(stale_online[0].id, stale.id);
    }

    #[tokio::test]
    async fn selectable_orders_by_load_then_id() {
        let pool = test_pool().await;
        let a = register_server(&pool, "a", "eu", "10.0.0.1", 5000, "http://a", 100)
            .await
            .unwrap();
        let b = register_server(&pool, "b", "eu", "10.0.0.2", 5000, "http://b", 100)
            .await
            .unwrap();
        heartbeat(&pool, &a.id, 50.0).await.unwrap();
        heartbeat(&pool, &b.id, 2.0).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(120);
        let selectable = list_selectable(&pool, None, cutoff).await.unwrap();
        assert_eq!(selectable[0].id, b.id);
        assert_eq!(selectable[1].id, a.id);
    }
}
