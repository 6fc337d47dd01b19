//! Auth service: registration, password login, session refresh and resets.
//!
//! Handlers stay thin; the lockout and anti-enumeration rules live here.

use std::sync::Arc;

use messagelove_core::auth::lockout::{LockoutDecision, LockoutIdentity};
use messagelove_core::auth::password::{
    hash_password_async, validate_password_strength, verify_password_async,
};
use messagelove_core::auth::{AuthError, normalize_email, reset, valid_email};
use messagelove_core::models::auth::{NewUser, TokenClaims, User};
use tracing::{info, warn};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{
    AuthResponse, ForgotPasswordRequest, LoginRequest, MessageResponse, RegisterRequest,
    ResetPasswordRequest, TokenResponse, UserResponse,
};

/// Longest accepted display name, in characters.
const MAX_NAME_LEN: usize = 100;

/// Same text whether or not the account exists.
pub const FORGOT_PASSWORD_MESSAGE: &str =
    "If an account exists for that email, a password reset link has been sent.";

pub const RESET_PASSWORD_MESSAGE: &str = "Password has been reset.";

/// Mint a session token for `user`.
pub fn issue_session(state: &AppState, user: User) -> AppResult<AuthResponse> {
    let now = state.clock.now();
    let token = state.tokens.generate_at(&user.id, &user.email, now)?;
    Ok(AuthResponse {
        token,
        expires_at: now + state.tokens.ttl(),
        user: user.into(),
    })
}

/// Create a password account and sign it in.
pub async fn register(state: &AppState, req: RegisterRequest) -> AppResult<AuthResponse> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Name is required".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "Name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    let email = normalize_email(&req.email);
    if !valid_email(&email) {
        return Err(AppError::Validation("Invalid email address".into()));
    }
    validate_password_strength(&req.password)?;

    let password_hash = hash_password_async(&req.password).await?;
    let user = state
        .repo
        .create_user(NewUser {
            email,
            name: name.to_string(),
            password_hash: Some(password_hash),
            external_identity_id: None,
        })
        .await?;
    info!(user_id = %user.id, "user registered");
    issue_session(state, user)
}

/// Password login guarded by the lockout policy.
///
/// The attempt is reserved with the lockout guard before the password is
/// checked, so parallel guesses count against the same threshold. Unknown
/// email, OAuth-only account and wrong password are indistinguishable to the
/// caller.
pub async fn login(
    state: &AppState,
    fingerprint: &str,
    req: LoginRequest,
) -> AppResult<AuthResponse> {
    let email = normalize_email(&req.email);
    let identity = LockoutIdentity::new(fingerprint, &email);
    let now = state.clock.now();

    if let LockoutDecision::Locked { retry_after_secs } =
        state.lockout.begin_attempt(&identity, now).await?
    {
        warn!(identity = identity.as_str(), retry_after_secs, "login rejected while locked out");
        return Err(AppError::AccountLocked { retry_after_secs });
    }

    let found = if valid_email(&email) {
        state.repo.find_user_by_email(&email).await?
    } else {
        None
    };
    let hash = found.as_ref().and_then(|u| u.password_hash.as_deref());
    let verified = verify_password_async(&req.password, hash).await?;

    match found {
        Some(found) if verified => {
            state.lockout.record_success(&identity).await?;
            info!(user_id = %found.user.id, "login succeeded");
            issue_session(state, found.user)
        }
        _ => {
            warn!(identity = identity.as_str(), "login failed");
            Err(AppError::InvalidCredentials)
        }
    }
}

/// Re-mint a token for the caller of a still-valid session.
pub async fn refresh(state: &AppState, claims: &TokenClaims) -> AppResult<TokenResponse> {
    let user = current_user(state, claims).await?;
    let session = issue_session(state, user)?;
    Ok(TokenResponse {
        token: session.token,
        expires_at: session.expires_at,
    })
}

pub async fn me(state: &AppState, claims: &TokenClaims) -> AppResult<UserResponse> {
    let user = current_user(state, claims).await?;
    Ok(UserResponse { user: user.into() })
}

async fn current_user(state: &AppState, claims: &TokenClaims) -> AppResult<User> {
    state
        .repo
        .find_user_by_id(&claims.sub)
        .await?
        .ok_or(AppError::TokenInvalid)
}

/// Issue a reset link when the account exists. The response never varies,
/// and link delivery happens in a background task.
pub async fn forgot_password(
    state: &AppState,
    req: ForgotPasswordRequest,
) -> AppResult<MessageResponse> {
    let policy = state.config.reset_policy();
    let issued = reset::request_reset(state.repo.as_ref(), &req.email, &policy, state.clock.now())
        .await?;
    // Delivery runs off the request path; the response does not wait on it.
    if let Some(issued) = issued {
        let email = normalize_email(&req.email);
        let notifier = Arc::clone(&state.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send_reset_link(&email, &issued).await {
                warn!(user_id = %issued.user_id, error = %e, "could not deliver reset link");
            }
        });
    }
    Ok(MessageResponse {
        message: FORGOT_PASSWORD_MESSAGE.into(),
    })
}

/// Redeem a reset token.
pub async fn reset_password(
    state: &AppState,
    req: ResetPasswordRequest,
) -> AppResult<MessageResponse> {
    reset::reset_password(
        state.repo.as_ref(),
        &req.email,
        &req.token,
        &req.new_password,
        state.clock.now(),
    )
    .await
    .map_err(|e| match e {
        AuthError::TokenInvalid | AuthError::TokenExpired => AppError::InvalidResetToken,
        other => AppError::from(other),
    })?;
    Ok(MessageResponse {
        message: RESET_PASSWORD_MESSAGE.into(),
    })
}
