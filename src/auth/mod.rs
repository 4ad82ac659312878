use axum::{Router, routing::get};

use crate::AppState;

mod clients;
mod lockin;
mod login;
mod logout;

pub use clients::Clients;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login::login))
        .route("/lockin", get(lockin::lockin))
        .route("/logout", get(logout::logout))
}
