use axum::{debug_handler, extract::Query, response::Redirect};
use serde::Deserialize;
use tower_sessions::Session;

use crate::AppResult;

#[derive(Deserialize)]
pub(crate) struct LogoutQuery {
    return_url: Option<String>,
}

/// Drops the session from the store entirely, not just the cycled cookie.
#[debug_handler]
pub(crate) async fn logout(
    Query(LogoutQuery { return_url }): Query<LogoutQuery>,
    session: Session,
) -> AppResult<Redirect> {
    session.flush().await?;

    let return_url = return_url.unwrap_or_else(|| "/".to_string());
    Ok(Redirect::to(&return_url))
}
