//! JWT session token generation and verification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::{info, warn};

use super::AuthError;
use crate::models::auth::TokenClaims;

/// Default session token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Mints and verifies HS256 session tokens.
///
/// Tokens are stateless: validity is the signature plus the `exp` claim. There
/// is no server-side revocation.
#[derive(Clone)]
pub struct TokenService {
    secret: Arc<[u8]>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            secret: Arc::from(secret),
            ttl,
        }
    }

    /// Configured token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generate a token issued now.
    pub fn generate(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        self.generate_at(user_id, email, Utc::now())
    }

    /// Generate a token issued at `now`.
    pub fn generate_at(
        &self,
        user_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| AuthError::Internal("session expiry out of range".into()))?;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))
    }

    /// Verify a token, distinguishing expiry from every other failure.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let key = DecodingKey::from_secret(&self.secret);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        decode::<TokenClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid,
            })
    }
}

/// Resolve the JWT secret: env var `JWT_SECRET` → persisted file.
pub fn resolve_jwt_secret() -> String {
    if let Ok(secret) = std::env::var("JWT_SECRET")
        && !secret.is_empty()
    {
        return secret;
    }
    resolve_jwt_secret_from(&jwt_secret_path())
}

/// Read the secret persisted at `path`, generating and persisting one if absent.
pub fn resolve_jwt_secret_from(secret_path: &Path) -> String {
    if let Ok(existing) = std::fs::read_to_string(secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret: String = rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    if let Some(parent) = secret_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::write(secret_path, &secret) {
        Ok(()) => info!(path = %secret_path.display(), "generated new JWT secret"),
        Err(e) => warn!(
            path = %secret_path.display(),
            error = %e,
            "could not persist JWT secret; sessions will not survive a restart"
        ),
    }
    secret
}

/// Path to the persisted JWT secret file.
fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("messagelove")
        .join("jwt-secret")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"test-secret", Duration::seconds(DEFAULT_TOKEN_TTL_SECS))
    }

    #[test]
    fn fresh_token_verifies_with_subject() {
        let tokens = service();
        let token = tokens.generate("user-1", "alice@example.com").expect("token");
        let claims = tokens.verify(&token).expect("valid");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.exp - claims.iat, DEFAULT_TOKEN_TTL_SECS);
    }

    #[test]
    fn token_past_ttl_is_expired() {
        let tokens = service();
        let issued = Utc::now() - Duration::seconds(DEFAULT_TOKEN_TTL_SECS + 5);
        let token = tokens
            .generate_at("user-1", "alice@example.com", issued)
            .expect("token");
        assert!(matches!(tokens.verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn token_from_other_secret_is_invalid() {
        let other = TokenService::new(b"other-secret", Duration::hours(1));
        let token = other.generate("user-1", "alice@example.com").expect("token");
        assert!(matches!(service().verify(&token), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn expired_token_from_other_secret_is_invalid_not_expired() {
        let other = TokenService::new(b"other-secret", Duration::hours(1));
        let token = other
            .generate_at("user-1", "a@example.com", Utc::now() - Duration::hours(3))
            .expect("token");
        assert!(matches!(service().verify(&token), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn tampered_payload_is_invalid() {
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let tokens = service();
        let token = tokens.generate("user-1", "alice@example.com").expect("token");
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload = URL_SAFE_NO_PAD.decode(parts[1]).expect("payload");
        let mut claims: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        claims["sub"] = serde_json::json!("user-2");
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("encode"));
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);

        assert!(matches!(tokens.verify(&tampered), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(service().verify("not.a.jwt"), Err(AuthError::TokenInvalid)));
        assert!(matches!(service().verify(""), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn tokens_minted_in_the_same_second_differ() {
        let tokens = service();
        let now = Utc::now();
        let a = tokens.generate_at("u", "a@example.com", now).expect("token");
        let b = tokens.generate_at("u", "a@example.com", now).expect("token");
        assert_ne!(a, b);
    }

    #[test]
    fn secret_file_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("jwt-secret");
        let first = resolve_jwt_secret_from(&path);
        assert_eq!(first.len(), 64);
        let second = resolve_jwt_secret_from(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn out_of_range_ttl_is_an_error_not_a_panic() {
        let tokens = TokenService::new(b"test-secret", Duration::MAX);
        assert!(matches!(
            tokens.generate("user-1", "alice@example.com"),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let rendered = format!("{:?}", service());
        assert!(!rendered.contains("test-secret"));
    }
}
