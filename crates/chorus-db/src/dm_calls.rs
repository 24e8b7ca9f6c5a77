use chrono::Utc;

use crate::{datetime_to_db_text, DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DmChannelRow {
    pub id: i64,
    pub user_a: i64,
    pub user_b: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DmCallRow {
    pub id: i64,
    pub channel_id: i64,
    pub started_by: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub voice_server_id: Option<String>,
}

pub async fn create_dm_channel(
    pool: &DbPool,
    id: i64,
    user_a: i64,
    user_b: i64,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO dm_channels (id, user_a, user_b) VALUES (?1, ?2, ?3)")
        .bind(id)
        .bind(user_a)
        .bind(user_b)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_dm_channel(pool: &DbPool, id: i64) -> Result<Option<DmChannelRow>, DbError> {
    let row = sqlx::query_as::<_, DmChannelRow>(
        "SELECT id, user_a, user_b FROM dm_channels WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn is_dm_participant(
    pool: &DbPool,
    channel_id: i64,
    user_id: i64,
) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM dm_channels WHERE id = ?1 AND (user_a = ?2 OR user_b = ?2)",
    )
    .bind(channel_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// The call currently running on a DM channel, if any.
pub async fn get_active_call(
    pool: &DbPool,
    channel_id: i64,
) -> Result<Option<DmCallRow>, DbError> {
    let row = sqlx::query_as::<_, DmCallRow>(
        "SELECT id, channel_id, started_by, started_at, ended_at, voice_server_id
         FROM dm_calls WHERE channel_id = ?1 AND ended_at IS NULL
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Record a call start; a still-active call on the channel is reused.
pub async fn start_call(
    pool: &DbPool,
    call_id: i64,
    channel_id: i64,
    started_by: i64,
    voice_server_id: &str,
) -> Result<DmCallRow, DbError> {
    if let Some(active) = get_active_call(pool, channel_id).await? {
        return Ok(active);
    }

    sqlx::query(
        "INSERT INTO dm_calls (id, channel_id, started_by, started_at, voice_server_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(call_id)
    .bind(channel_id)
    .bind(started_by)
    .bind(datetime_to_db_text(Utc::now()))
    .bind(voice_server_id)
    .execute(pool)
    .await?;

    get_active_call(pool, channel_id)
        .await?
        .ok_or(DbError::NotFound)
}

/// Stamp the active call as ended.
pub async fn end_call(pool: &DbPool, channel_id: i64) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE dm_calls SET ended_at = ?2 WHERE channel_id = ?1 AND ended_at IS NULL",
    )
    .bind(channel_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Re-home the active call after a server failure.
pub async fn set_voice_server(
    pool: &DbPool,
    channel_id: i64,
    server_id: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE dm_calls SET voice_server_id = ?2 WHERE channel_id = ?1 AND ended_at IS NULL",
    )
    .bind(channel_id)
    .bind(server_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Active calls pinned to the given voice server.
pub async fn calls_pinned_to(pool: &DbPool, server_id: &str) -> Result<Vec<DmCallRow>, DbError> {
    let rows = sqlx::query_as::<_, DmCallRow>(
        "SELECT id, channel_id, started_by, started_at, ended_at, voice_server_id
         FROM dm_calls WHERE voice_server_id = ?1 AND ended_at IS NULL",
    )
    .bind(server_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
