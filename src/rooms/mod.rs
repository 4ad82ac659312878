pub mod history;
pub mod membership;
pub mod msg;
pub mod read;
pub mod room;
mod ws;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(history::rooms_for_user).post(room::create))
        .route("/{room_id}", get(room::details))
        .route("/{room_id}/description", put(room::description))
        .route("/{room_id}/request", post(membership::request))
        .route("/{room_id}/requests/{user_id}", put(membership::decide))
        .route("/{room_id}/members/{user_id}", delete(membership::remove))
        .route("/{room_id}/leave", delete(membership::leave))
        .route("/{room_id}/admin/{user_id}", get(membership::admin_check))
        .route("/{room_id}/messages", get(history::messages).post(msg::create))
        .route("/{room_id}/messages/latest", get(msg::latest))
        .route("/{room_id}/messages/{message_id}", delete(msg::delete))
        .route("/{room_id}/read", get(read::status).post(read::mark))
        .route("/{room_id}/ws", get(ws::room_ws))
}
