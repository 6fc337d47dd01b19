//! Authentication request handlers.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::{Extension, Json};
use axum_extra::extract::cookie::CookieJar;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::middleware::fingerprint::ClientFingerprint;
use crate::models::{
    AuthResponse, ForgotPasswordRequest, LoginRequest, MessageResponse, RegisterRequest,
    ResetPasswordRequest, TokenResponse, UserResponse,
};
use crate::services::auth;
use crate::services::cookies::{clear_session_cookie, session_cookie};

fn with_session_cookie(state: &AppState, jar: CookieJar, token: &str) -> CookieJar {
    jar.add(session_cookie(
        token,
        state.tokens.ttl().num_seconds(),
        state.config.is_production(),
    ))
}

/// `POST /auth/register`: create a new user account.
pub async fn register_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<(StatusCode, CookieJar, Json<AuthResponse>)> {
    let Json(body) = payload?;
    let resp = auth::register(&state, body).await?;
    let jar = with_session_cookie(&state, jar, &resp.token);
    Ok((StatusCode::CREATED, jar, Json(resp)))
}

/// `POST /auth/login`: authenticate with email + password.
pub async fn login_handler(
    State(state): State<AppState>,
    fingerprint: ClientFingerprint,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<(CookieJar, Json<AuthResponse>)> {
    let Json(body) = payload?;
    let resp = auth::login(&state, fingerprint.as_str(), body).await?;
    let jar = with_session_cookie(&state, jar, &resp.token);
    Ok((jar, Json(resp)))
}

/// `POST /auth/logout`: clear the session cookie. Tokens are stateless, so
/// a bearer token stays valid until it expires.
pub async fn logout_handler(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (StatusCode, CookieJar) {
    (
        StatusCode::NO_CONTENT,
        jar.add(clear_session_cookie(state.config.is_production())),
    )
}

/// `POST /auth/refresh`: re-mint a token from the current session.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<TokenResponse>)> {
    let resp = auth::refresh(&state, &claims).await?;
    let jar = with_session_cookie(&state, jar, &resp.token);
    Ok((jar, Json(resp)))
}

/// `GET /auth/me`
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
) -> AppResult<Json<UserResponse>> {
    Ok(Json(auth::me(&state, &claims).await?))
}

/// `POST /auth/forgot-password`: always answers with the same message.
pub async fn forgot_password_handler(
    State(state): State<AppState>,
    payload: Result<Json<ForgotPasswordRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    Ok(Json(auth::forgot_password(&state, body).await?))
}

/// `POST /auth/reset-password`
pub async fn reset_password_handler(
    State(state): State<AppState>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    Ok(Json(auth::reset_password(&state, body).await?))
}
