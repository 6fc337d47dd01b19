//! Google sign-in handlers.
//!
//! Both legs are browser redirects, so failures redirect to the frontend
//! login page instead of returning an error body.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::warn;

use crate::AppState;
use crate::services::cookies::session_cookie;
use crate::services::oauth::{self, CallbackParams};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginParams {
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `302 Found` to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

fn frontend(state: &AppState) -> &str {
    state.config.frontend_url.trim_end_matches('/')
}

fn failure_redirect(state: &AppState) -> Response {
    found(&format!("{}/login?error=oauth_failed", frontend(state)))
}

/// `GET /auth/google`: redirect to Google.
pub async fn google_begin_handler(
    State(state): State<AppState>,
    Query(params): Query<BeginParams>,
) -> Response {
    match oauth::begin(&state, params.redirect_to.as_deref()).await {
        Ok(url) => found(&url),
        Err(e) => {
            warn!(error = %e, "could not start google sign-in");
            failure_redirect(&state)
        }
    }
}

/// `GET /auth/google/callback`: finish sign-in and hand the session to the
/// frontend as a cookie plus a `#token=` fragment.
pub async fn google_callback_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let params = CallbackParams {
        code: query.code,
        state: query.state,
        error: query.error,
    };
    match oauth::complete(&state, params).await {
        Ok(done) => {
            let jar = jar.add(session_cookie(
                &done.session.token,
                state.tokens.ttl().num_seconds(),
                state.config.is_production(),
            ));
            let location = format!(
                "{}{}#token={}",
                frontend(&state),
                done.redirect_to,
                done.session.token
            );
            (jar, found(&location)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "google sign-in failed");
            failure_redirect(&state)
        }
    }
}
