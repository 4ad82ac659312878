use axum::{Json, debug_handler, extract::{Path, State}, response::IntoResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState, Fanout, Store,
    fanout::{MemberUpdate, RoomDeleted},
    session,
};

use super::room;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MemberStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Membership {
    pub room_id: Uuid,
    pub user_id: String,
    pub status: MemberStatus,
    pub joined_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The member is gone; when the admin left, the successor's id.
    Left { new_admin_id: Option<String> },
    /// The last member left, taking the room with them.
    RoomDeleted,
}

/// Pure admin predicate. As an authorization guard use `require_admin` on the
/// mutating transaction's connection, never a separate earlier read.
pub async fn is_admin(conn: &mut SqliteConnection, room_id: Uuid, user_id: &str) -> AppResult<bool> {
    let admin_id: Option<String> = sqlx::query_scalar("SELECT admin_id FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;

    match admin_id {
        None => Err(AppError::NotFound("room")),
        Some(admin_id) => Ok(admin_id == user_id),
    }
}

pub(crate) async fn require_admin(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<()> {
    if !is_admin(conn, room_id, user_id).await? {
        return Err(AppError::Forbidden("only the room admin can do that"));
    }
    Ok(())
}

/// NONE -> PENDING. `Conflict` when any membership row (pending or approved)
/// already exists for the pair. No read-state side effects yet.
pub async fn request_join(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<Membership> {
    let room_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;
    if room_exists.is_none() {
        return Err(AppError::NotFound("room"));
    }

    let membership = sqlx::query_as::<_, Membership>(
        "INSERT INTO memberships (room_id,user_id,status,joined_at) VALUES (?,?,?,?) RETURNING *",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(MemberStatus::Pending)
    .bind(OffsetDateTime::now_utc())
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict("join request")
        }
        err => err.into(),
    })?;

    Ok(membership)
}

/// PENDING -> APPROVED (read-state row appears in lockstep, unread since the
/// room may already have history) or PENDING -> deleted. `NotFound` unless a
/// pending row exists; a rejected user may request again from scratch.
pub async fn decide_request(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    actor: &str,
    user_id: &str,
    decision: Decision,
) -> AppResult<Option<Membership>> {
    require_admin(conn, room_id, actor).await?;

    let status: Option<MemberStatus> =
        sqlx::query_scalar("SELECT status FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

    if status != Some(MemberStatus::Pending) {
        return Err(AppError::NotFound("join request"));
    }

    match decision {
        Decision::Approve => {
            let membership = sqlx::query_as::<_, Membership>(
                "UPDATE memberships SET status=? WHERE room_id=? AND user_id=? RETURNING *",
            )
            .bind(MemberStatus::Approved)
            .bind(room_id)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?;

            sqlx::query("INSERT INTO read_states (room_id,user_id,unread) VALUES (?,?,1)")
                .bind(room_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;

            Ok(Some(membership))
        }
        Decision::Reject => {
            sqlx::query("DELETE FROM memberships WHERE room_id=? AND user_id=?")
                .bind(room_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;

            Ok(None)
        }
    }
}

/// Admin-only removal. Removing oneself as admin runs succession first, same
/// as leaving, so admin_id can never dangle.
pub async fn remove_member(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    actor: &str,
    user_id: &str,
) -> AppResult<LeaveOutcome> {
    // first write grabs the room row, serializing against concurrent exits
    room::touch_room(conn, room_id).await?;
    require_admin(conn, room_id, actor).await?;

    let is_member: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
    if is_member.is_none() {
        return Err(AppError::NotFound("member"));
    }

    if user_id == actor {
        return depart(conn, room_id, user_id).await;
    }

    delete_member_rows(conn, room_id, user_id).await?;
    Ok(LeaveOutcome::Left { new_admin_id: None })
}

/// Any member may leave. When the admin leaves, succession runs inside the
/// same transaction: the remaining APPROVED member with the smallest user id
/// takes over, and with nobody left the room is deleted outright.
pub async fn leave_room(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<LeaveOutcome> {
    room::touch_room(conn, room_id).await?;

    let is_member: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
    if is_member.is_none() {
        return Err(AppError::NotFound("member"));
    }

    depart(conn, room_id, user_id).await
}

/// Shared exit path: succession when the leaver holds admin, then row
/// cleanup. Caller has already taken the room's write lock.
async fn depart(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<LeaveOutcome> {
    let admin_id: String = sqlx::query_scalar("SELECT admin_id FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_one(&mut *conn)
        .await?;

    if admin_id == user_id {
        let successor: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM memberships \
             WHERE room_id=? AND status=? AND user_id<>? \
             ORDER BY user_id ASC LIMIT 1",
        )
        .bind(room_id)
        .bind(MemberStatus::Approved)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(successor) = successor else {
            // empty rooms are garbage collected, cascading members,
            // messages and read states
            sqlx::query("DELETE FROM rooms WHERE id=?")
                .bind(room_id)
                .execute(&mut *conn)
                .await?;
            return Ok(LeaveOutcome::RoomDeleted);
        };

        sqlx::query("UPDATE rooms SET admin_id=? WHERE id=?")
            .bind(&successor)
            .bind(room_id)
            .execute(&mut *conn)
            .await?;

        delete_member_rows(conn, room_id, user_id).await?;
        return Ok(LeaveOutcome::Left {
            new_admin_id: Some(successor),
        });
    }

    delete_member_rows(conn, room_id, user_id).await?;
    Ok(LeaveOutcome::Left { new_admin_id: None })
}

async fn delete_member_rows(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    user_id: &str,
) -> AppResult<()> {
    sqlx::query("DELETE FROM memberships WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM read_states WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[debug_handler(state = AppState)]
pub(crate) async fn request(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let membership = request_join(&mut tx, room_id, &user_id).await?;
    tx.commit().await?;

    fanout.publish(
        &room_id.to_string(),
        "joinRequested",
        &MemberUpdate {
            room_id,
            user_id,
            new_admin_id: None,
        },
    );

    Ok(Json(membership))
}

#[derive(Deserialize)]
pub(crate) struct DecideBody {
    decision: Decision,
}

#[debug_handler(state = AppState)]
pub(crate) async fn decide(
    Path((room_id, user_id)): Path<(Uuid, String)>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
    Json(DecideBody { decision }): Json<DecideBody>,
) -> AppResult<impl IntoResponse> {
    let actor = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let membership = decide_request(&mut tx, room_id, &actor, &user_id, decision).await?;
    tx.commit().await?;

    let update = MemberUpdate {
        room_id,
        user_id: user_id.clone(),
        new_admin_id: None,
    };
    match decision {
        Decision::Approve => {
            fanout.publish(&room_id.to_string(), "memberApproved", &update);
            fanout.publish(&user_id, "memberApproved", &update);
        }
        Decision::Reject => fanout.publish(&user_id, "joinRejected", &update),
    }

    Ok(Json(membership))
}

#[debug_handler(state = AppState)]
pub(crate) async fn remove(
    Path((room_id, user_id)): Path<(Uuid, String)>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let actor = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let outcome = remove_member(&mut tx, room_id, &actor, &user_id).await?;
    tx.commit().await?;

    publish_exit(&fanout, room_id, &user_id, "memberRemoved", &outcome);
    Ok(Json(serde_json::json!({ "removed": user_id })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let user_id = session::require_user(&session).await?;

    let mut tx = store.begin().await?;
    let outcome = leave_room(&mut tx, room_id, &user_id).await?;
    tx.commit().await?;

    publish_exit(&fanout, room_id, &user_id, "memberLeft", &outcome);
    Ok(Json(serde_json::json!({ "left": user_id })))
}

fn publish_exit(
    fanout: &Fanout,
    room_id: Uuid,
    user_id: &str,
    event: &str,
    outcome: &LeaveOutcome,
) {
    match outcome {
        LeaveOutcome::Left { new_admin_id } => {
            let update = MemberUpdate {
                room_id,
                user_id: user_id.to_owned(),
                new_admin_id: new_admin_id.clone(),
            };
            fanout.publish(&room_id.to_string(), event, &update);
            fanout.publish(user_id, event, &update);
        }
        LeaveOutcome::RoomDeleted => {
            let deleted = RoomDeleted { room_id };
            fanout.publish(&room_id.to_string(), "roomDeleted", &deleted);
            fanout.publish(user_id, "roomDeleted", &deleted);
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn admin_check(
    Path((room_id, user_id)): Path<(Uuid, String)>,
    State(store): State<Store>,
) -> AppResult<impl IntoResponse> {
    let mut conn = store.pool().acquire().await?;
    let is_admin = is_admin(&mut conn, room_id, &user_id).await?;
    Ok(Json(serde_json::json!({ "isAdmin": is_admin })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::room::create_room;

    async fn store() -> Store {
        Store::in_memory().await.unwrap()
    }

    async fn room_with(store: &Store, admin: &str, members: &[&str]) -> Uuid {
        let mut tx = store.begin().await.unwrap();
        let room = create_room(&mut tx, admin, "den", None).await.unwrap();
        for member in members {
            request_join(&mut tx, room.id, member).await.unwrap();
            decide_request(&mut tx, room.id, admin, member, Decision::Approve)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        room.id
    }

    async fn admin_of(store: &Store, room_id: Uuid) -> Option<String> {
        sqlx::query_scalar("SELECT admin_id FROM rooms WHERE id=?")
            .bind(room_id)
            .fetch_optional(store.pool())
            .await
            .unwrap()
    }

    async fn status_of(store: &Store, room_id: Uuid, user: &str) -> Option<MemberStatus> {
        sqlx::query_scalar("SELECT status FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user)
            .fetch_optional(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_join_request_conflicts() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &[]).await;

        let mut tx = store.begin().await.unwrap();
        request_join(&mut tx, room_id, "bob").await.unwrap();
        let err = request_join(&mut tx, room_id, "bob").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn approve_needs_admin_and_creates_read_state() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &[]).await;

        let mut tx = store.begin().await.unwrap();
        request_join(&mut tx, room_id, "bob").await.unwrap();

        let err = decide_request(&mut tx, room_id, "mallory", "bob", Decision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let approved = decide_request(&mut tx, room_id, "alice", "bob", Decision::Approve)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(approved.status, MemberStatus::Approved);
        tx.commit().await.unwrap();

        // joined mid-life: starts unread
        let unread: bool =
            sqlx::query_scalar("SELECT unread FROM read_states WHERE room_id=? AND user_id=?")
                .bind(room_id)
                .bind("bob")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert!(unread);
    }

    #[tokio::test]
    async fn reject_deletes_and_allows_fresh_request() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &[]).await;

        let mut tx = store.begin().await.unwrap();
        request_join(&mut tx, room_id, "bob").await.unwrap();
        let rejected = decide_request(&mut tx, room_id, "alice", "bob", Decision::Reject)
            .await
            .unwrap();
        assert!(rejected.is_none());
        tx.commit().await.unwrap();

        assert_eq!(status_of(&store, room_id, "bob").await, None);

        let mut tx = store.begin().await.unwrap();
        request_join(&mut tx, room_id, "bob").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            status_of(&store, room_id, "bob").await,
            Some(MemberStatus::Pending)
        );
    }

    #[tokio::test]
    async fn deciding_without_pending_row_is_not_found() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &["bob"]).await;

        let mut tx = store.begin().await.unwrap();
        // bob is already approved, carol never asked
        for target in ["bob", "carol"] {
            let err = decide_request(&mut tx, room_id, "alice", target, Decision::Approve)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn remove_non_member_is_not_found() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &["bob"]).await;

        let mut tx = store.begin().await.unwrap();
        let err = remove_member(&mut tx, room_id, "alice", "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound("member")));
    }

    #[tokio::test]
    async fn remove_is_admin_only() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &["bob", "carol"]).await;

        let mut tx = store.begin().await.unwrap();
        let err = remove_member(&mut tx, room_id, "bob", "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn admin_leaving_promotes_smallest_user_id() {
        let store = store().await;
        let room_id = room_with(&store, "zed", &["carol", "bob"]).await;

        let mut tx = store.begin().await.unwrap();
        let outcome = leave_room(&mut tx, room_id, "zed").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            outcome,
            LeaveOutcome::Left {
                new_admin_id: Some("bob".into())
            }
        );
        assert_eq!(admin_of(&store, room_id).await.as_deref(), Some("bob"));
        // bystander memberships untouched
        assert_eq!(
            status_of(&store, room_id, "carol").await,
            Some(MemberStatus::Approved)
        );
        assert_eq!(status_of(&store, room_id, "zed").await, None);
    }

    #[tokio::test]
    async fn succession_skips_pending_members() {
        let store = store().await;
        let room_id = room_with(&store, "zed", &["carol"]).await;

        let mut tx = store.begin().await.unwrap();
        // "aaron" sorts first but is only pending
        request_join(&mut tx, room_id, "aaron").await.unwrap();
        let outcome = leave_room(&mut tx, room_id, "zed").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            outcome,
            LeaveOutcome::Left {
                new_admin_id: Some("carol".into())
            }
        );
    }

    #[tokio::test]
    async fn sole_admin_leaving_deletes_the_room() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &[]).await;

        let mut tx = store.begin().await.unwrap();
        let outcome = leave_room(&mut tx, room_id, "alice").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, LeaveOutcome::RoomDeleted);
        assert_eq!(admin_of(&store, room_id).await, None);

        let mut conn = store.pool().acquire().await.unwrap();
        let err = is_admin(&mut conn, room_id, "alice").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound("room")));
    }

    #[tokio::test]
    async fn admin_removing_self_runs_succession() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &["bob"]).await;

        let mut tx = store.begin().await.unwrap();
        let outcome = remove_member(&mut tx, room_id, "alice", "alice")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            outcome,
            LeaveOutcome::Left {
                new_admin_id: Some("bob".into())
            }
        );
        assert_eq!(admin_of(&store, room_id).await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn admin_always_references_an_approved_member() {
        let store = store().await;
        let room_id = room_with(&store, "dave", &["bob", "carol", "erin"]).await;

        // churn through a create/approve/remove/leave sequence, checking the
        // invariant after every transition
        let script: &[(&str, &str)] = &[
            ("leave", "dave"),
            ("remove", "carol"),
            ("leave", "erin"),
            ("leave", "bob"),
        ];

        for (op, user) in script {
            // look the admin up before the transaction claims the only
            // test connection
            let admin = admin_of(&store, room_id).await;
            let mut tx = store.begin().await.unwrap();
            match *op {
                "leave" => {
                    leave_room(&mut tx, room_id, user).await.unwrap();
                }
                _ => {
                    let admin = admin.unwrap();
                    remove_member(&mut tx, room_id, &admin, user).await.unwrap();
                }
            }
            tx.commit().await.unwrap();

            match admin_of(&store, room_id).await {
                Some(admin) => assert_eq!(
                    status_of(&store, room_id, &admin).await,
                    Some(MemberStatus::Approved)
                ),
                // room deleted once empty
                None => {
                    let count: i64 =
                        sqlx::query_scalar("SELECT COUNT(*) FROM memberships WHERE room_id=?")
                            .bind(room_id)
                            .fetch_one(store.pool())
                            .await
                            .unwrap();
                    assert_eq!(count, 0);
                }
            }
        }
        assert_eq!(admin_of(&store, room_id).await, None);
    }

    #[tokio::test]
    async fn concurrent_leaves_delete_the_room_exactly_once() {
        let store = store().await;
        let room_id = room_with(&store, "alice", &["bob"]).await;

        let leave = |user: &'static str| {
            let store = store.clone();
            async move {
                let mut tx = store.begin().await?;
                let outcome = leave_room(&mut tx, room_id, user).await?;
                tx.commit().await?;
                Ok::<_, AppError>(outcome)
            }
        };

        let (a, b) = tokio::join!(leave("alice"), leave("bob"));
        let outcomes = [a.unwrap(), b.unwrap()];
        let deletes = outcomes
            .iter()
            .filter(|o| **o == LeaveOutcome::RoomDeleted)
            .count();
        assert_eq!(deletes, 1);

        // no dangling rows either way
        for table in ["memberships", "read_states", "messages"] {
            let count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE room_id=?"))
                    .bind(room_id)
                    .fetch_one(store.pool())
                    .await
                    .unwrap();
            assert_eq!(count, 0, "{table} left dangling rows");
        }
        assert_eq!(admin_of(&store, room_id).await, None);
    }
}
