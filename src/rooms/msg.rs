use axum::{Json, debug_handler, extract::{Path, State}, response::IntoResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppError, AppResult, AppState, Fanout, Store, fanout::MessageDeleted, session};

use super::{membership::MemberStatus, read};

/// Immutable once created; the only later mutation is a hard delete.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_id: String,
    pub content: String,
    pub created_at: OffsetDateTime,
}

/// Personalized rendering for one recipient. Translation is a stub: content
/// passes through unchanged.
// TODO: wire up the Azure translator (AZURE_TRANS_KEY/LOCATION) behind this
pub(crate) fn translate(content: &str, _recipient: &str) -> String {
    content.to_owned()
}

/// Insert the message, refresh the room's activity and last-message
/// snapshot, and flag every other member unread, all in the caller's
/// transaction.
pub async fn create_message(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    author_id: &str,
    content: &str,
) -> AppResult<Message> {
    if content.trim().is_empty() {
        return Err(AppError::InvalidInput("message content is required"));
    }

    let room_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;
    if room_exists.is_none() {
        return Err(AppError::NotFound("room"));
    }

    let status: Option<MemberStatus> =
        sqlx::query_scalar("SELECT status FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(author_id)
            .fetch_optional(&mut *conn)
            .await?;
    if status != Some(MemberStatus::Approved) {
        return Err(AppError::Forbidden("only approved members can post"));
    }

    let message = sqlx::query_as::<_, Message>(
        "INSERT INTO messages (id,room_id,author_id,content,created_at) \
         VALUES (?,?,?,?,?) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(room_id)
    .bind(author_id)
    .bind(content)
    .bind(OffsetDateTime::now_utc())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE rooms SET updated_at=?, last_message_content=?, last_message_at=? WHERE id=?")
        .bind(message.created_at)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(room_id)
        .execute(&mut *conn)
        .await?;

    read::mark_room_unread(conn, room_id, author_id).await?;

    Ok(message)
}

/// Hard delete by the author or the room admin; the last-message snapshot is
/// recomputed from whatever remains.
pub async fn delete_message(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    actor: &str,
    message_id: Uuid,
) -> AppResult<()> {
    let author_id: Option<String> =
        sqlx::query_scalar("SELECT author_id FROM messages WHERE id=? AND room_id=?")
            .bind(message_id)
            .bind(room_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(author_id) = author_id else {
        return Err(AppError::NotFound("message"));
    };

    if author_id != actor && !super::membership::is_admin(conn, room_id, actor).await? {
        return Err(AppError::Forbidden("only the author or the admin can delete a message"));
    }

    sqlx::query("DELETE FROM messages WHERE id=?")
        .bind(message_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "UPDATE rooms SET \
           last_message_content=(SELECT content FROM messages WHERE room_id=? ORDER BY id DESC LIMIT 1), \
           last_message_at=(SELECT created_at FROM messages WHERE room_id=? ORDER BY id DESC LIMIT 1) \
         WHERE id=?",
    )
    .bind(room_id)
    .bind(room_id)
    .bind(room_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn latest_message(conn: &mut SqliteConnection, room_id: Uuid) -> AppResult<Message> {
    let room_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;
    if room_exists.is_none() {
        return Err(AppError::NotFound("room"));
    }

    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE room_id=? ORDER BY id DESC LIMIT 1",
    )
    .bind(room_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AppError::NotFound("message"))
}

/// Full send path shared by the HTTP handler and the websocket loop: one
/// transaction, then fan-out strictly after commit.
pub(crate) async fn post_message(
    store: &Store,
    fanout: &Fanout,
    room_id: Uuid,
    author_id: &str,
    content: &str,
) -> AppResult<Message> {
    let mut tx = store.begin().await?;
    let message = create_message(&mut tx, room_id, author_id, content).await?;

    let recipients: Vec<String> = sqlx::query_scalar(
        "SELECT user_id FROM memberships WHERE room_id=? AND status=? AND user_id<>?",
    )
    .bind(room_id)
    .bind(MemberStatus::Approved)
    .bind(author_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    fanout.publish(&room_id.to_string(), "newMessage", &message);
    for recipient in recipients {
        let mut personalized = message.clone();
        personalized.content = translate(&message.content, &recipient);
        fanout.publish(&recipient, "translatedMessage", &personalized);
    }

    Ok(message)
}

#[derive(Deserialize)]
pub(crate) struct SendMessageBody {
    pub(crate) content: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn create(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
    Json(SendMessageBody { content }): Json<SendMessageBody>,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;
    let message = post_message(&store, &fanout, room_id, &user_id, &content).await?;
    Ok(Json(message))
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete(
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    delete_message(&mut tx, room_id, &user_id, message_id).await?;
    tx.commit().await?;

    fanout.publish(
        &room_id.to_string(),
        "messageDeleted",
        &MessageDeleted { message_id },
    );

    Ok(Json(serde_json::json!({ "deleted": message_id })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn latest(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
) -> AppResult<impl IntoResponse> {
    let mut conn = store.pool().acquire().await?;
    Ok(Json(latest_message(&mut conn, room_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::membership::{Decision, decide_request, request_join};
    use crate::rooms::room::{create_room, room_details};

    async fn room_with_member(store: &Store) -> Uuid {
        let mut tx = store.begin().await.unwrap();
        let room = create_room(&mut tx, "alice", "den", None).await.unwrap();
        request_join(&mut tx, room.id, "bob").await.unwrap();
        decide_request(&mut tx, room.id, "alice", "bob", Decision::Approve)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        room.id
    }

    #[tokio::test]
    async fn only_approved_members_can_post() {
        let store = Store::in_memory().await.unwrap();
        let room_id = room_with_member(&store).await;

        let mut tx = store.begin().await.unwrap();
        request_join(&mut tx, room_id, "carol").await.unwrap();

        // pending requester and stranger are both rejected
        for author in ["carol", "mallory"] {
            let err = create_message(&mut tx, room_id, author, "hi")
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Forbidden(_)));
        }

        let err = create_message(&mut tx, room_id, "alice", "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        create_message(&mut tx, room_id, "bob", "hi").await.unwrap();
    }

    #[tokio::test]
    async fn create_refreshes_the_room_snapshot() {
        let store = Store::in_memory().await.unwrap();
        let room_id = room_with_member(&store).await;

        let mut tx = store.begin().await.unwrap();
        create_message(&mut tx, room_id, "alice", "first").await.unwrap();
        let second = create_message(&mut tx, room_id, "bob", "second").await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        let details = room_details(&mut conn, room_id).await.unwrap();
        assert_eq!(details.room.last_message_content.as_deref(), Some("second"));
        assert_eq!(details.room.last_message_at, Some(second.created_at));
        assert_eq!(details.room.updated_at, second.created_at);
    }

    #[tokio::test]
    async fn delete_is_author_or_admin_only_and_fixes_snapshot() {
        let store = Store::in_memory().await.unwrap();
        let room_id = room_with_member(&store).await;

        let mut tx = store.begin().await.unwrap();
        let first = create_message(&mut tx, room_id, "alice", "first").await.unwrap();
        let second = create_message(&mut tx, room_id, "bob", "second").await.unwrap();

        let err = delete_message(&mut tx, room_id, "bob", first.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        // admin may delete someone else's message
        delete_message(&mut tx, room_id, "alice", second.id).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        let details = room_details(&mut conn, room_id).await.unwrap();
        assert_eq!(details.room.last_message_content.as_deref(), Some("first"));

        let latest = latest_message(&mut conn, room_id).await.unwrap();
        assert_eq!(latest.id, first.id);
    }

    #[tokio::test]
    async fn deleting_a_missing_message_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let room_id = room_with_member(&store).await;

        let mut tx = store.begin().await.unwrap();
        let err = delete_message(&mut tx, room_id, "alice", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound("message")));
    }

    #[tokio::test]
    async fn post_message_fans_out_after_commit() {
        let store = Store::in_memory().await.unwrap();
        let fanout = Fanout::new();
        let room_id = room_with_member(&store).await;

        let mut room_rx = fanout.subscribe(&room_id.to_string());
        let mut bob_rx = fanout.subscribe("bob");
        let mut alice_rx = fanout.subscribe("alice");

        post_message(&store, &fanout, room_id, "alice", "hello")
            .await
            .unwrap();

        let frame = room_rx.recv().await.unwrap();
        assert!(frame.contains("newMessage"));

        // personalized copy reaches recipients, never the author
        let frame = bob_rx.recv().await.unwrap();
        assert!(frame.contains("translatedMessage"));
        assert!(alice_rx.try_recv().is_err());
    }
}
