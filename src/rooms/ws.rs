use axum::{
    debug_handler,
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppError, AppResult, AppState, Fanout, Store, session};

use super::{membership::MemberStatus, msg};

/// Live feed for one room: the room topic plus the caller's private topic
/// (personalized events) multiplexed onto one socket. Delivery is
/// best-effort; a client that lagged out re-fetches history by cursor.
#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(store): State<Store>,
    State(fanout): State<Fanout>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = session::require_user(&session).await?;

    let status: Option<MemberStatus> =
        sqlx::query_scalar("SELECT status FROM memberships WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(&user_id)
            .fetch_optional(store.pool())
            .await?;
    if status != Some(MemberStatus::Approved) {
        return Err(AppError::Forbidden("not a member of this room"));
    }

    Ok(ws.on_upgrade(move |stream| async move {
        let mut room_rx = fanout.subscribe(&room_id.to_string());
        let mut user_rx = fanout.subscribe(&user_id);
        let (mut sender, mut receiver) = stream.split();

        let mut forward_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = room_rx.recv() => frame,
                    frame = user_rx.recv() => frame,
                };
                // a lagged receiver skips ahead; a closed one ends the feed
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if sender.send(frame.into()).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(frame)) = receiver.next().await {
            let Ok(msg::SendMessageBody { content }) = serde_json::from_slice(&frame.into_data())
            else {
                continue;
            };

            if let Err(err) = msg::post_message(&store, &fanout, room_id, &user_id, &content).await
            {
                tracing::debug!(%room_id, %user_id, %err, "ws message rejected");
            }
        }

        forward_task.abort();
        let _ = (&mut forward_task).await;
    }))
}
