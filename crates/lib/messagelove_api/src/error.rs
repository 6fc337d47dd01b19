//! Application error types.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use messagelove_core::auth::AuthError;
use thiserror::Error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Detail of a 500 response, attached as a response extension for the
/// error-sanitizing middleware. Never serialized by [`AppError`] itself.
#[derive(Debug, Clone)]
pub struct InternalErrorDetail(pub String);

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account locked")]
    AccountLocked { retry_after_secs: u64 },

    #[error("Token expired")]
    TokenExpired,

    #[error("Token invalid")]
    TokenInvalid,

    #[error("Invalid or expired reset token")]
    InvalidResetToken,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidResetToken => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::TokenExpired | AppError::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            AppError::AccountLocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::AccountLocked { .. } => "account_locked",
            AppError::TokenExpired => "token_expired",
            AppError::TokenInvalid => "token_invalid",
            AppError::InvalidResetToken => "invalid_reset_token",
            AppError::Conflict(_) => "conflict",
            AppError::ExternalService(_) => "external_service_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Validation(m) | AppError::Conflict(m) => m.clone(),
            AppError::InvalidCredentials => "Invalid email or password".into(),
            AppError::AccountLocked { .. } => {
                "Too many failed login attempts, try again later".into()
            }
            AppError::TokenExpired => "Session expired".into(),
            AppError::TokenInvalid => "Invalid session token".into(),
            AppError::InvalidResetToken => "Invalid or expired reset token".into(),
            AppError::ExternalService(_) => "Identity provider unavailable".into(),
            AppError::Internal(_) => "Internal server error".into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            AppError::AccountLocked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message: self.public_message(),
            retry_after,
            detail: None,
        });
        let mut response = (status, body).into_response();

        if let Some(secs) = retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        match self {
            AppError::Internal(detail) | AppError::ExternalService(detail) => {
                response.extensions_mut().insert(InternalErrorDetail(detail));
            }
            _ => {}
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Internal(format!("database: {e}"))
    }
}

/// Malformed, mistyped or incomplete request bodies are validation errors.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match &rejection {
            JsonRejection::MissingJsonContentType(_) => {
                "Expected a JSON body with Content-Type: application/json".to_string()
            }
            other => other.body_text(),
        };
        AppError::Validation(message)
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Validation(msg) => AppError::Validation(msg),
            AuthError::InvalidCredentials => AppError::InvalidCredentials,
            AuthError::AccountLocked { retry_after_secs } => {
                AppError::AccountLocked { retry_after_secs }
            }
            AuthError::TokenExpired => AppError::TokenExpired,
            AuthError::TokenInvalid => AppError::TokenInvalid,
            AuthError::Conflict(msg) => AppError::Conflict(msg),
            AuthError::ExternalService(msg) => AppError::ExternalService(msg),
            AuthError::OAuthState => {
                AppError::Validation("Sign-in request expired or was already used".into())
            }
            AuthError::EmailNotVerified => {
                AppError::Validation("Provider email address is not verified".into())
            }
            AuthError::DbError(e) => AppError::from(e),
            AuthError::Internal(msg) => AppError::Internal(msg),
        }
    }
}
