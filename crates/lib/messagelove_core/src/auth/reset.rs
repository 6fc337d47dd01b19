//! Password reset with one-time, hashed, short-lived tokens.
//!
//! A token is *issued* by [`request_reset`] and ends either *consumed* by a
//! successful [`reset_password`] or *expired* (a predicate checked at
//! validation time, not a stored state). Only the SHA-256 of the secret is
//! persisted.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use super::AuthError;
use super::password::{hash_password_async, validate_password_strength};
use super::repository::AuthRepository;
use super::{normalize_email, valid_email};
use crate::models::auth::User;

/// Default reset token lifetime: 15 minutes.
pub const DEFAULT_RESET_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Random bytes per secret (256 bits).
const SECRET_BYTES: usize = 32;

/// Issuing parameters.
#[derive(Debug, Clone)]
pub struct ResetPolicy {
    pub ttl: Duration,
    /// Frontend origin the reset link points at.
    pub frontend_url: String,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_RESET_TOKEN_TTL_SECS),
            frontend_url: "http://localhost:3000".into(),
        }
    }
}

/// A token that was just issued. `secret` exists only here and in `reset_url`.
#[derive(Debug, Clone)]
pub struct IssuedReset {
    pub user_id: String,
    pub secret: String,
    pub reset_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Generate a URL-safe reset secret.
pub fn generate_reset_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hash a reset secret for storage.
pub fn hash_reset_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build `{frontend}/reset-password?token=..&email=..`.
pub fn build_reset_url(frontend_url: &str, secret: &str, email: &str) -> Result<String, AuthError> {
    let base = frontend_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/reset-password"))
        .map_err(|e| AuthError::Internal(format!("invalid frontend url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("token", secret)
        .append_pair("email", email);
    Ok(url.into())
}

/// Issue a reset token for `email` if the account exists.
///
/// Returns `None` for unknown or malformed emails. Callers must respond the
/// same way in both cases.
pub async fn request_reset(
    repo: &dyn AuthRepository,
    email: &str,
    policy: &ResetPolicy,
    now: DateTime<Utc>,
) -> Result<Option<IssuedReset>, AuthError> {
    let email = normalize_email(email);
    if !valid_email(&email) {
        return Ok(None);
    }
    let Some(found) = repo.find_user_by_email(&email).await? else {
        debug!("password reset requested for unknown email");
        return Ok(None);
    };

    let secret = generate_reset_secret();
    let expires_at = now
        .checked_add_signed(policy.ttl)
        .ok_or_else(|| AuthError::Internal("reset expiry out of range".into()))?;
    repo.insert_reset_token(&found.user.id, &hash_reset_secret(&secret), expires_at)
        .await?;
    let reset_url = build_reset_url(&policy.frontend_url, &secret, &found.user.email)?;

    Ok(Some(IssuedReset {
        user_id: found.user.id,
        secret,
        reset_url,
        expires_at,
    }))
}

/// Redeem a reset secret and set a new password.
///
/// Unknown email, wrong secret, expired token and reused token all yield
/// [`AuthError::TokenInvalid`]. Password policy violations are reported as
/// [`AuthError::Validation`] before any token lookup.
pub async fn reset_password(
    repo: &dyn AuthRepository,
    email: &str,
    presented_secret: &str,
    new_password: &str,
    now: DateTime<Utc>,
) -> Result<User, AuthError> {
    validate_password_strength(new_password)?;

    let email = normalize_email(email);
    let Some(found) = repo.find_user_by_email(&email).await? else {
        return Err(AuthError::TokenInvalid);
    };
    let token_hash = hash_reset_secret(presented_secret.trim());
    let Some(record) = repo.find_reset_token(&found.user.id, &token_hash).await? else {
        return Err(AuthError::TokenInvalid);
    };
    if !record.is_usable_at(now) {
        return Err(AuthError::TokenInvalid);
    }

    let password_hash = hash_password_async(new_password).await?;
    if !repo
        .complete_password_reset(&record.id, &found.user.id, &password_hash, now)
        .await?
    {
        // Lost a race with another redemption of the same token.
        return Err(AuthError::TokenInvalid);
    }

    info!(user_id = %found.user.id, "password reset completed");
    Ok(found.user)
}

/// Garbage-collect expired tokens.
pub async fn purge_expired(repo: &dyn AuthRepository, now: DateTime<Utc>) -> Result<u64, AuthError> {
    repo.purge_expired_reset_tokens(now).await
}
