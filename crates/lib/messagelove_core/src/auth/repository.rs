//! User and reset-token persistence.
//!
//! [`AuthRepository`] is the storage seam for every auth flow. [`PgAuthRepository`]
//! is the production implementation; `memory::MemoryAuthRepository` backs tests
//! and single-process development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::AuthError;
use crate::models::auth::{NewUser, PasswordResetTokenRecord, User, UserWithPassword};
use crate::uuid::uuidv7;

/// Storage operations needed by the auth flows.
///
/// Emails passed in are already normalized; implementations still compare
/// case-insensitively.
#[async_trait]
pub trait AuthRepository: Send + Sync {
    /// Fetch a user (with password hash) by email.
    async fn find_user_by_email(&self, email: &str)
    -> Result<Option<UserWithPassword>, AuthError>;

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError>;

    async fn find_user_by_external_id(&self, external_id: &str)
    -> Result<Option<User>, AuthError>;

    /// Insert a user. Duplicate email or external id is [`AuthError::Conflict`].
    async fn create_user(&self, new_user: NewUser) -> Result<User, AuthError>;

    /// Attach an external identity to an existing user.
    async fn link_external_identity(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<User, AuthError>;

    /// Store a reset token hash.
    async fn insert_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<PasswordResetTokenRecord, AuthError>;

    /// Find the user's reset token with this hash, regardless of state.
    async fn find_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTokenRecord>, AuthError>;

    /// Atomically mark the token used and store the new password hash.
    ///
    /// Returns `false`, with nothing written, if the token was already used or
    /// expired by `now`. On success every other outstanding token for the user
    /// is marked used as well.
    async fn complete_password_reset(
        &self,
        token_id: &str,
        user_id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError>;

    /// Delete tokens that expired before `now`. Returns the number removed.
    async fn purge_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;
}

type UserRow = (
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<String>,
);

type ResetTokenRow = (
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

const USER_COLUMNS: &str =
    "id::text, email, name, external_identity_id, created_at, updated_at, password_hash";

const RESET_TOKEN_COLUMNS: &str =
    "id::text, user_id::text, token_hash, expires_at, used_at, created_at";

fn user_from_row(row: UserRow) -> UserWithPassword {
    let (id, email, name, external_identity_id, created_at, updated_at, password_hash) = row;
    UserWithPassword {
        user: User {
            id,
            email,
            name,
            external_identity_id,
            created_at,
            updated_at,
        },
        password_hash,
    }
}

fn reset_token_from_row(row: ResetTokenRow) -> PasswordResetTokenRecord {
    let (id, user_id, token_hash, expires_at, used_at, created_at) = row;
    PasswordResetTokenRecord {
        id,
        user_id,
        token_hash,
        expires_at,
        used_at,
        created_at,
    }
}

/// SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// PostgreSQL-backed repository.
#[derive(Debug, Clone)]
pub struct PgAuthRepository {
    pool: PgPool,
}

impl PgAuthRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuthRepository for PgAuthRepository {
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserWithPassword>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1::uuid"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(r).user))
    }

    async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_identity_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(r).user))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, AuthError> {
        if !new_user.has_auth_method() {
            return Err(AuthError::Validation(
                "user needs a password or an external identity".into(),
            ));
        }
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (email, name, password_hash, external_identity_id) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&new_user.email)
        .bind(&new_user.name)
        .bind(&new_user.password_hash)
        .bind(&new_user.external_identity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AuthError::Conflict("Email already registered".into())
            } else {
                AuthError::from(e)
            }
        })?;
        Ok(user_from_row(row).user)
    }

    async fn link_external_identity(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<User, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET external_identity_id = $2, updated_at = now() \
             WHERE id = $1::uuid RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AuthError::Conflict("External identity already linked".into())
            } else {
                AuthError::from(e)
            }
        })?;
        row.map(|r| user_from_row(r).user)
            .ok_or_else(|| AuthError::Internal(format!("user {user_id} vanished while linking")))
    }

    async fn insert_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<PasswordResetTokenRecord, AuthError> {
        let row = sqlx::query_as::<_, ResetTokenRow>(&format!(
            "INSERT INTO password_reset_tokens (id, user_id, token_hash, expires_at) \
             VALUES ($1, $2::uuid, $3, $4) RETURNING {RESET_TOKEN_COLUMNS}"
        ))
        .bind(uuidv7())
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(reset_token_from_row(row))
    }

    async fn find_reset_token(
        &self,
        user_id: &str,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTokenRecord>, AuthError> {
        let row = sqlx::query_as::<_, ResetTokenRow>(&format!(
            "SELECT {RESET_TOKEN_COLUMNS} FROM password_reset_tokens \
             WHERE user_id = $1::uuid AND token_hash = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(reset_token_from_row))
    }

    async fn complete_password_reset(
        &self,
        token_id: &str,
        user_id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let mut tx = self.pool.begin().await?;

        let consumed = sqlx::query(
            "UPDATE password_reset_tokens SET used_at = $3 \
             WHERE id = $1::uuid AND user_id = $2::uuid \
               AND used_at IS NULL AND expires_at > $3",
        )
        .bind(token_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if consumed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1::uuid")
            .bind(user_id)
            .bind(password_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE password_reset_tokens SET used_at = $2 \
             WHERE user_id = $1::uuid AND used_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn purge_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn user_row_maps_every_column() {
        let now = Utc::now();
        let row: UserRow = (
            "u1".into(),
            "alice@example.com".into(),
            "Alice".into(),
            Some("google:1".into()),
            now,
            now,
            Some("$2b$10$hash".into()),
        );
        let mapped = user_from_row(row);
        assert_eq!(mapped.user.id, "u1");
        assert_eq!(mapped.user.external_identity_id.as_deref(), Some("google:1"));
        assert_eq!(mapped.password_hash.as_deref(), Some("$2b$10$hash"));
    }
}
