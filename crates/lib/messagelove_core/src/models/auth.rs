//! Authentication domain models.
//!
//! These are internal domain models, distinct from the HTTP request/response
//! shapes in `messagelove_api` (which rename fields to camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Normalized (trimmed, lowercase) email.
    pub email: String,
    pub name: String,
    /// Provider-qualified subject, e.g. `google:1234`.
    pub external_identity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User with password hash (for internal auth flows).
#[derive(Debug, Clone)]
pub struct UserWithPassword {
    pub user: User,
    /// `None` for OAuth-only accounts.
    pub password_hash: Option<String>,
}

/// Input for creating a user. At least one of `password_hash` and
/// `external_identity_id` must be set.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub external_identity_id: Option<String>,
}

impl NewUser {
    /// Whether the user would have a way to sign in.
    pub fn has_auth_method(&self) -> bool {
        self.password_hash.is_some() || self.external_identity_id.is_some()
    }
}

/// Password reset token row. Only the SHA-256 hash of the secret is stored.
#[derive(Debug, Clone)]
pub struct PasswordResetTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PasswordResetTokenRecord {
    /// Unused and not yet expired.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

/// JWT claims embedded in session tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: user ID (standard JWT `sub` claim).
    pub sub: String,
    /// User email.
    pub email: String,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Random token id; keeps two tokens minted in the same second distinct.
    pub jti: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(expires_in: Duration, used: bool) -> PasswordResetTokenRecord {
        let now = Utc::now();
        PasswordResetTokenRecord {
            id: "t1".into(),
            user_id: "u1".into(),
            token_hash: "h".into(),
            expires_at: now + expires_in,
            used_at: used.then_some(now),
            created_at: now,
        }
    }

    #[test]
    fn reset_token_usable_only_when_unused_and_unexpired() {
        let now = Utc::now();
        assert!(record(Duration::minutes(5), false).is_usable_at(now));
        assert!(!record(Duration::minutes(5), true).is_usable_at(now));
        assert!(!record(Duration::minutes(-1), false).is_usable_at(now));
    }

    #[test]
    fn new_user_requires_an_auth_method() {
        let user = NewUser {
            email: "a@example.com".into(),
            name: "A".into(),
            password_hash: None,
            external_identity_id: None,
        };
        assert!(!user.has_auth_method());
        let oauth = NewUser {
            external_identity_id: Some("google:1".into()),
            ..user
        };
        assert!(oauth.has_auth_method());
    }
}
