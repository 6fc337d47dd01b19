//! In-memory [`AuthRepository`].
//!
//! Process-local and lost on restart. Used by tests and by the server when no
//! `DATABASE_URL` is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::AuthError;
use super::repository::AuthRepository;
use crate::models::auth::{NewUser, PasswordResetTokenRecord, User, UserWithPassword};
use crate::uuid::uuidv7;

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserWithPassword>,
    reset_tokens: HashMap<String, PasswordResetTokenRecord>,
}

impl MemoryState {
    fn user_by_email(&self, email: &str) -> Option<&UserWithPassword> {
        self.users
            .values()
            .find(|u| u.user.email.eq_ignore_ascii_case(email))
    }

    fn external_id_taken(&self, external_id: &str, except_user: Option<&str>) -> bool {
        self.users.values().any(|u| {
            u.user.external_identity_id.as_deref() == Some(external_id)
                && Some(u.user.id.as_str()) != except_user
        })
    }
}

/// Repository held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryAuthRepository {
    state: RwLock<MemoryState>,
}

impl MemoryAuthRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reset token rows currently stored.
    pub async fn reset_token_count(&self) -> usize {
        self.state.read().await.reset_tokens.len()
    }

    /// Number of users currently stored.
    pub async fn user_count(&self) -> usize {
        self.state.read().await.users.len()
    }
}

#[async_trait]
impl AuthRepository for MemoryAuthRepository {
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserWithPassword>, AuthError> {
        Ok(self.state.read().await.user_by_email(email).cloned())
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        Ok(self
            .state
            .read()
            .await
            .users
            .get(user_id)
            .map(|u| u.user.clone()))
    }

    async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, AuthError> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.user.external_identity_id.as_deref() == Some(external_id))
            .map(|u| u.user.clone()))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, AuthError> {
        if !new_user.has_auth_method() {
            return Err(AuthError::Validation(
                "user needs a password or an external identity".into(),
            ));
        }
        let mut state = self.state.write().await;
        if state.user_by_email(&new_user.email).is_some() {
            return Err(AuthError::Conflict("Email already registered".into()));
        }
        if let Some(external_id) = new_user.external_identity_id.as_deref()
            && state.external_id_taken(external_id, None)
        {
            return Err(AuthError::Conflict("External identity already linked".into()));
        }
        let now = Utc::now();
        let user = User {
            id: uuidv7().to_string(),
            email: new_user.email,
            name: new_user.name,
            external_identity_id: new_user.external_identity_id,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(
            user.id.clone(),
            UserWithPassword {
                user: user.clone(),
                password_hash: new_user.password_hash,
            },
        );
        Ok(user)
    }

    async fn link_external_identity(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<User, AuthError> {
        let mut state = self.state.write().await;
        if state.external_id_taken(external_id, Some(user_id)) {
            return Err(AuthError::Conflict("External identity already linked".into()));
        }
        let entry = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| AuthError::Internal(format!("user {user_id} vanished while linking")))?;
        entry.user.external_identity_id = Some(external_id.to_string());
        entry.user.updated_at = Utc::now();
        Ok(entry.user.clone())
    }

    async fn insert_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<PasswordResetTokenRecord, AuthError> {
        let record = PasswordResetTokenRecord {
            id: uuidv7().to_string(),
            user_id: user_id.to_string(),
            token_hash: token_hash.to_string(),
            expires_at,
            used_at: None,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .reset_tokens
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTokenRecord>, AuthError> {
        Ok(self
            .state
            .read()
            .await
            .reset_tokens
            .values()
            .filter(|t| t.user_id == user_id && t.token_hash == token_hash)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn complete_password_reset(
        &self,
        token_id: &str,
        user_id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        // Single write guard: both updates land together or not at all.
        let mut state = self.state.write().await;
        let usable = state
            .reset_tokens
            .get(token_id)
            .is_some_and(|t| t.user_id == user_id && t.is_usable_at(now));
        if !usable || !state.users.contains_key(user_id) {
            return Ok(false);
        }
        if let Some(user) = state.users.get_mut(user_id) {
            user.password_hash = Some(password_hash.to_string());
            user.user.updated_at = now;
        }
        for token in state.reset_tokens.values_mut() {
            if token.user_id == user_id && token.used_at.is_none() {
                token.used_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn purge_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut state = self.state.write().await;
        let before = state.reset_tokens.len();
        state.reset_tokens.retain(|_, t| t.expires_at >= now);
        Ok((before - state.reset_tokens.len()) as u64)
    }
}
