use axum::{Json, debug_handler, extract::{Path, Query, State}, response::IntoResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState, Store,
    pagination::{Cursor, Page},
    session,
};

use super::{membership::MemberStatus, msg::Message, room::Room};

pub const MESSAGE_PAGE_SIZE: usize = 20;
pub const ROOM_PAGE_SIZE: usize = 10;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MessageWithSender {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub message: Message,
    pub given_name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct RoomSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub room: Room,
    pub unread: bool,
}

/// Oldest-first page of a room's messages, strictly after `cursor`
/// (exclusive). Ids are the ordering key, so rows inserted after a page was
/// handed out always land in a later page; nothing already returned moves.
pub async fn list_messages(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    cursor: Option<Cursor>,
) -> AppResult<Page<MessageWithSender>> {
    let room_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;
    if room_exists.is_none() {
        return Err(AppError::NotFound("room"));
    }

    let items = match cursor {
        Some(cursor) => {
            sqlx::query_as::<_, MessageWithSender>(
                "SELECT m.id, m.room_id, m.author_id, m.content, m.created_at, \
                        u.given_name, u.picture \
                 FROM messages m LEFT JOIN users u ON u.id = m.author_id \
                 WHERE m.room_id=? AND m.id>? ORDER BY m.id ASC LIMIT ?",
            )
            .bind(room_id)
            .bind(cursor)
            .bind(MESSAGE_PAGE_SIZE as i64)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, MessageWithSender>(
                "SELECT m.id, m.room_id, m.author_id, m.content, m.created_at, \
                        u.given_name, u.picture \
                 FROM messages m LEFT JOIN users u ON u.id = m.author_id \
                 WHERE m.room_id=? ORDER BY m.id ASC LIMIT ?",
            )
            .bind(room_id)
            .bind(MESSAGE_PAGE_SIZE as i64)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    Ok(Page::new(items, MESSAGE_PAGE_SIZE, |m| m.message.id))
}

/// Most-recently-active rooms where the user is APPROVED, annotated with the
/// unread flag and the denormalized last-message snapshot. Keyset
/// continuation on (updated_at, id) descending.
pub async fn list_rooms(
    conn: &mut SqliteConnection,
    user_id: &str,
    cursor: Option<Cursor>,
) -> AppResult<Page<RoomSummary>> {
    let items = match cursor {
        Some(cursor) => {
            let pivot: Option<OffsetDateTime> =
                sqlx::query_scalar("SELECT updated_at FROM rooms WHERE id=?")
                    .bind(cursor)
                    .fetch_optional(&mut *conn)
                    .await?;
            let Some(pivot) = pivot else {
                return Err(AppError::InvalidInput("unknown cursor"));
            };

            sqlx::query_as::<_, RoomSummary>(
                "SELECT r.*, rs.unread \
                 FROM rooms r \
                 JOIN memberships m ON m.room_id = r.id AND m.user_id=? AND m.status=? \
                 JOIN read_states rs ON rs.room_id = r.id AND rs.user_id=? \
                 WHERE r.updated_at<? OR (r.updated_at=? AND r.id<?) \
                 ORDER BY r.updated_at DESC, r.id DESC LIMIT ?",
            )
            .bind(user_id)
            .bind(MemberStatus::Approved)
            .bind(user_id)
            .bind(pivot)
            .bind(pivot)
            .bind(cursor)
            .bind(ROOM_PAGE_SIZE as i64)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, RoomSummary>(
                "SELECT r.*, rs.unread \
                 FROM rooms r \
                 JOIN memberships m ON m.room_id = r.id AND m.user_id=? AND m.status=? \
                 JOIN read_states rs ON rs.room_id = r.id AND rs.user_id=? \
                 ORDER BY r.updated_at DESC, r.id DESC LIMIT ?",
            )
            .bind(user_id)
            .bind(MemberStatus::Approved)
            .bind(user_id)
            .bind(ROOM_PAGE_SIZE as i64)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    Ok(Page::new(items, ROOM_PAGE_SIZE, |r| r.room.id))
}

#[derive(Deserialize)]
pub(crate) struct CursorQuery {
    cursor: Option<Uuid>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    Path(room_id): Path<Uuid>,
    Query(CursorQuery { cursor }): Query<CursorQuery>,
    State(store): State<Store>,
) -> AppResult<impl IntoResponse> {
    let mut conn = store.pool().acquire().await?;
    Ok(Json(list_messages(&mut conn, room_id, cursor).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn rooms_for_user(
    Query(CursorQuery { cursor }): Query<CursorQuery>,
    State(store): State<Store>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut conn = store.pool().acquire().await?;
    Ok(Json(list_rooms(&mut conn, &user_id, cursor).await?))
}
