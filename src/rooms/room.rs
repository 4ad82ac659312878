use axum::{Json, debug_handler, extract::{Path, State}, response::IntoResponse};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppError, AppResult, AppState, Store, session};

use super::membership::{self, MemberStatus};

const AVATAR_COLORS: [&str; 8] = [
    "#e74c3c", "#e67e22", "#f1c40f", "#2ecc71", "#1abc9c", "#3498db", "#9b59b6", "#34495e",
];

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub admin_id: String,
    pub avatar_color: String,
    pub avatar_text: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MemberProfile {
    pub user_id: String,
    pub status: MemberStatus,
    pub joined_at: OffsetDateTime,
    pub given_name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomDetails {
    #[serde(flatten)]
    pub room: Room,
    pub members: Vec<MemberProfile>,
}

/// The creator becomes admin and an APPROVED member in the same transaction,
/// with a read-state row from the start (nothing to read yet).
pub async fn create_room(
    conn: &mut SqliteConnection,
    admin_id: &str,
    name: &str,
    description: Option<&str>,
) -> AppResult<Room> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("room name is required"));
    }

    let avatar_color = AVATAR_COLORS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(AVATAR_COLORS[0]);
    let avatar_text = name
        .chars()
        .next()
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_default();
    let now = OffsetDateTime::now_utc();

    let room = sqlx::query_as::<_, Room>(
        "INSERT INTO rooms (id,name,description,admin_id,avatar_color,avatar_text,created_at,updated_at) \
         VALUES (?,?,?,?,?,?,?,?) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(name)
    .bind(description)
    .bind(admin_id)
    .bind(avatar_color)
    .bind(avatar_text)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO memberships (room_id,user_id,status,joined_at) VALUES (?,?,?,?)")
        .bind(room.id)
        .bind(admin_id)
        .bind(MemberStatus::Approved)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    sqlx::query("INSERT INTO read_states (room_id,user_id,unread) VALUES (?,?,0)")
        .bind(room.id)
        .bind(admin_id)
        .execute(&mut *conn)
        .await?;

    Ok(room)
}

pub async fn room_details(conn: &mut SqliteConnection, room_id: Uuid) -> AppResult<RoomDetails> {
    let room = sqlx::query_as::<_, Room>("SELECT * FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(AppError::NotFound("room"))?;

    let members = sqlx::query_as::<_, MemberProfile>(
        "SELECT m.user_id, m.status, m.joined_at, u.given_name, u.picture \
         FROM memberships m LEFT JOIN users u ON u.id = m.user_id \
         WHERE m.room_id=? ORDER BY m.joined_at ASC, m.user_id ASC",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(RoomDetails { room, members })
}

pub async fn update_description(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    actor: &str,
    description: Option<&str>,
) -> AppResult<Room> {
    membership::require_admin(conn, room_id, actor).await?;

    let room = sqlx::query_as::<_, Room>(
        "UPDATE rooms SET description=?, updated_at=? WHERE id=? RETURNING *",
    )
    .bind(description)
    .bind(OffsetDateTime::now_utc())
    .bind(room_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(room)
}

/// Bump updated_at. Doubles as the existence check and, as the first write of
/// succession-bearing transactions, takes the room's write lock up front.
pub(crate) async fn touch_room(conn: &mut SqliteConnection, room_id: Uuid) -> AppResult<()> {
    let affected = sqlx::query("UPDATE rooms SET updated_at=? WHERE id=?")
        .bind(OffsetDateTime::now_utc())
        .bind(room_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if affected == 0 {
        return Err(AppError::NotFound("room"));
    }
    Ok(())
}

#[derive(Deserialize)]
pub(crate) struct CreateRoomBody {
    name: String,
    description: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn create(
    State(store): State<Store>,
    session: Session,
    Json(CreateRoomBody { name, description }): Json<CreateRoomBody>,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let room = create_room(&mut tx, &user_id, &name, description.as_deref()).await?;
    tx.commit().await?;

    tracing::info!(room_id = %room.id, admin = %user_id, "room created");
    Ok(Json(room))
}

#[debug_handler(state = AppState)]
pub(crate) async fn details(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
) -> AppResult<impl IntoResponse> {
    let mut conn = store.pool().acquire().await?;
    Ok(Json(room_details(&mut conn, room_id).await?))
}

#[derive(Deserialize)]
pub(crate) struct DescriptionBody {
    description: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn description(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    session: Session,
    Json(DescriptionBody { description }): Json<DescriptionBody>,
) -> AppResult<impl IntoResponse> {
    let actor = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let room = update_description(&mut tx, room_id, &actor, description.as_deref()).await?;
    tx.commit().await?;

    Ok(Json(room))
}
