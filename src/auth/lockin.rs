use axum::{
    debug_handler,
    extract::{Query, State},
    response::{IntoResponse, Redirect},
};
use oauth2::{AuthorizationCode, PkceCodeVerifier, TokenResponse};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{
    AppError, AppResult, AppState, Store,
    session::{CSRF_STATE, PKCE_VERIFIER, RETURN_URL, USER_ID},
};

use super::{Clients, clients::USERINFO_URL};

#[derive(Deserialize)]
pub(crate) struct LockinQuery {
    pub(crate) state: Option<String>,
    pub(crate) code: Option<String>,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
    given_name: Option<String>,
    picture: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn lockin(
    Query(LockinQuery { state, code }): Query<LockinQuery>,
    State(store): State<Store>,
    State(clients): State<Clients>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let state = state.ok_or(AppError::InvalidInput("missing oauth state"))?;
    let code = code.ok_or(AppError::InvalidInput("missing oauth code"))?;

    let Some(stored_state) = session.get::<String>(CSRF_STATE).await? else {
        return Err(AppError::Unauthorized);
    };
    if state != stored_state {
        return Err(AppError::Unauthorized);
    }

    let Some(pkce_verifier) = session.get::<String>(PKCE_VERIFIER).await? else {
        return Err(AppError::Unauthorized);
    };

    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = clients
        .google
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let info: UserInfo = http_client
        .get(USERINFO_URL)
        .bearer_auth(token_result.access_token().secret())
        .send()
        .await?
        .json()
        .await?;

    let mut tx = store.begin().await?;
    sqlx::query(
        "INSERT INTO users (id, given_name, picture) VALUES (?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET given_name = excluded.given_name, picture = excluded.picture",
    )
    .bind(&info.sub)
    .bind(&info.given_name)
    .bind(&info.picture)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    session.insert(USER_ID, info.sub.clone()).await?;
    tracing::info!(user_id = %info.sub, "signed in");

    let return_url: String = session
        .remove(RETURN_URL)
        .await?
        .unwrap_or_else(|| "/".to_string());
    Ok(Redirect::to(return_url.as_str()))
}
