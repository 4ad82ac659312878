use axum::{Json, debug_handler, extract::{Path, State}, response::IntoResponse};
use sqlx::SqliteConnection;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppError, AppResult, AppState, Store, session};

/// Flip every member's unread flag on except the author's, which is left
/// untouched. One conditional UPDATE keyed by room, not a per-recipient
/// loop; runs inside the message creation transaction.
pub(crate) async fn mark_room_unread(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    author_id: &str,
) -> AppResult<()> {
    sqlx::query("UPDATE read_states SET unread=1 WHERE room_id=? AND user_id<>?")
        .bind(room_id)
        .bind(author_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Explicit acknowledgement. Idempotent; `NotFound` when the caller is not
/// currently an approved member (no row exists then, by invariant).
pub async fn mark_read(conn: &mut SqliteConnection, room_id: Uuid, user_id: &str) -> AppResult<()> {
    let affected = sqlx::query("UPDATE read_states SET unread=0 WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if affected == 0 {
        return Err(AppError::NotFound("read state"));
    }
    Ok(())
}

pub async fn read_status(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<bool> {
    sqlx::query_scalar("SELECT unread FROM read_states WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(AppError::NotFound("read state"))
}

#[debug_handler(state = AppState)]
pub(crate) async fn mark(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    mark_read(&mut tx, room_id, &user_id).await?;
    tx.commit().await?;

    Ok(Json(serde_json::json!({ "unread": false })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn status(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut conn = store.pool().acquire().await?;
    let unread = read_status(&mut conn, room_id, &user_id).await?;
    Ok(Json(serde_json::json!({ "unread": unread })))
}
