use crate::{DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoomRow {
    pub id: i64,
    pub name: String,
    pub voice_server_id: Option<String>,
}

pub async fn create_room(pool: &DbPool, id: i64, name: &str) -> Result<(), DbError> {
    sqlx::query("INSERT INTO rooms (id, name) VALUES (?1, ?2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_room(pool: &DbPool, id: i64) -> Result<Option<RoomRow>, DbError> {
    let row = sqlx::query_as::<_, RoomRow>(
        "SELECT id, name, voice_server_id FROM rooms WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Pin (or clear) the room's voice server.
pub async fn set_voice_server(
    pool: &DbPool,
    room_id: i64,
    server_id: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE rooms SET voice_server_id = ?2 WHERE id = ?1")
        .bind(room_id)
        .bind(server_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Rooms currently pinned to the given voice server.
pub async fn rooms_pinned_to(pool: &DbPool, server_id: &str) -> Result<Vec<RoomRow>, DbError> {
    let rows = sqlx::query_as::<_, RoomRow>(
        "SELECT id, name, voice_server_id FROM rooms WHERE voice_server_id = ?1",
    )
    .bind(server_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn add_member(pool: &DbPool, room_id: i64, user_id: i64) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO room_members (room_id, user_id) VALUES (?1, ?2)
         ON CONFLICT (room_id, user_id) DO NOTHING",
    )
    .bind(room_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_member(pool: &DbPool, room_id: i64, user_id: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}
