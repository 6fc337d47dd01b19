//! Authentication middleware: session token extraction and JWT verification.

use axum::http::header::AUTHORIZATION;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use messagelove_core::auth::AuthError;
use messagelove_core::models::auth::TokenClaims;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::AppError;
use crate::services::cookies::SESSION_COOKIE;

/// Key used to store `TokenClaims` in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub TokenClaims);

/// Session token from `Authorization: Bearer`, falling back to the session
/// cookie.
pub fn extract_token(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    CookieJar::from_headers(request.headers())
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
}

/// Axum middleware: verifies the session token and injects
/// `AuthenticatedUser` into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(&request).ok_or(AppError::TokenInvalid)?;

    let claims = match state.tokens.verify(&token) {
        Ok(claims) => claims,
        Err(AuthError::TokenExpired) => {
            debug!(path = %request.uri().path(), "expired session token");
            return Err(AppError::TokenExpired);
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "rejected session token");
            return Err(AppError::from(e));
        }
    };

    request.extensions_mut().insert(AuthenticatedUser(claims));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let request = axum::http::Request::builder()
            .header(AUTHORIZATION, "Bearer header-token")
            .header("cookie", format!("{SESSION_COOKIE}=cookie-token"))
            .body(Body::empty())
            .expect("request");
        assert_eq!(extract_token(&request).as_deref(), Some("header-token"));
    }

    #[test]
    fn cookie_is_used_without_header() {
        let request = axum::http::Request::builder()
            .header("cookie", format!("other=1; {SESSION_COOKIE}=cookie-token"))
            .body(Body::empty())
            .expect("request");
        assert_eq!(extract_token(&request).as_deref(), Some("cookie-token"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        let request = axum::http::Request::builder()
            .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .expect("request");
        assert!(extract_token(&request).is_none());
    }
}
