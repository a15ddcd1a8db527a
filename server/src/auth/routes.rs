//! `/api/login` and `/api/logout`.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_extra::extract::cookie::SignedCookieJar;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{middleware::request_is_secure, session};
use crate::{app::AppState, http::api::api_error};

/// Public routes, mounted under `/api`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    /// Unix seconds after which the session cookie is refused.
    pub expires_at: u64,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(LoginRequest { password })) = payload else {
        warn!("login: malformed request");
        return api_error(StatusCode::BAD_REQUEST, "expected {\"password\": ...}");
    };
    if !state.auth.verify_password(&password) {
        warn!("login: wrong password");
        return api_error(StatusCode::UNAUTHORIZED, "invalid password");
    }

    let claims = state.auth.new_session();
    let secure = request_is_secure(&headers, state.orchestrator.status().active);
    let cookie = match session::session_cookie(&claims, state.auth.session_ttl(), secure) {
        Ok(cookie) => cookie,
        Err(e) => {
            error!("login: cannot encode session: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "cannot create session");
        }
    };
    let jar = SignedCookieJar::from_headers(&headers, state.auth.cookie_key()).add(cookie);
    info!(secure, "login: session created");
    (
        jar,
        Json(LoginResponse {
            message: "logged in".to_owned(),
            expires_at: claims.exp,
        }),
    )
        .into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let jar = SignedCookieJar::from_headers(&headers, state.auth.cookie_key())
        .remove(session::removal_cookie());
    info!("logout: session cookie removed");
    (jar, StatusCode::NO_CONTENT).into_response()
}
