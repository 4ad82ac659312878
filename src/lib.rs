pub mod auth;
pub mod error;
pub mod fanout;
pub mod pagination;
pub mod rooms;
pub mod session;
pub mod store;

pub use error::{AppError, AppResult};
pub use fanout::Fanout;
pub use store::Store;

use axum::extract::FromRef;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub clients: auth::Clients,
    pub fanout: Fanout,
}
