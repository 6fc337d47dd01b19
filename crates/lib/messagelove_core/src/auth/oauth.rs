//! Google sign-in.
//!
//! Authorization-code flow with a single-use CSRF state, server-side code
//! exchange, identity fetch and local account resolution. Pending states live
//! in an [`OAuthStateStore`]; the in-memory store is process-local like the
//! lockout store.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::repository::AuthRepository;
use super::{AuthError, normalize_email, valid_email};
use crate::clock::Clock;
use crate::models::auth::{NewUser, User};
use crate::tasks::spawn_periodic;

/// Lifetime of a pending state (10 minutes).
pub const STATE_TTL_SECS: i64 = 600;

/// Timeout applied to every provider HTTP call.
pub const PROVIDER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How often expired states are swept.
pub const STATE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

// =============================================================================
// State
// =============================================================================

/// Generate an unguessable state parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Reduce a caller-supplied post-login target to a same-origin path.
///
/// Only paths beginning with a single `/` survive; anything else becomes `/`.
pub fn sanitize_redirect_target(target: Option<&str>) -> String {
    match target.map(str::trim) {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// What is remembered between initiate and callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthPendingState {
    pub redirect_to: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for pending states.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    async fn insert(&self, state: String, pending: OAuthPendingState) -> Result<(), AuthError>;

    /// Remove the state and return it if it was still live at `now`.
    ///
    /// The entry is removed whether or not it had expired.
    async fn take(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthPendingState>, AuthError>;

    /// Drop expired states. Returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AuthError>;
}

/// Process-local [`OAuthStateStore`].
#[derive(Debug)]
pub struct MemoryOAuthStateStore {
    states: DashMap<String, OAuthPendingState>,
    ttl: Duration,
}

impl MemoryOAuthStateStore {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(STATE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn is_live(&self, pending: &OAuthPendingState, now: DateTime<Utc>) -> bool {
        now - pending.created_at <= self.ttl
    }
}

impl Default for MemoryOAuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OAuthStateStore for MemoryOAuthStateStore {
    async fn insert(&self, state: String, pending: OAuthPendingState) -> Result<(), AuthError> {
        self.states.insert(state, pending);
        Ok(())
    }

    async fn take(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthPendingState>, AuthError> {
        let Some((_, pending)) = self.states.remove(state) else {
            return Ok(None);
        };
        Ok(self.is_live(&pending, now).then_some(pending))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let before = self.states.len();
        self.states.retain(|_, pending| now - pending.created_at <= self.ttl);
        Ok(before.saturating_sub(self.states.len()))
    }
}

/// Sweep `store` every [`STATE_SWEEP_INTERVAL`] until `cancel` fires.
pub fn spawn_state_sweeper(
    store: Arc<dyn OAuthStateStore>,
    clock: Clock,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("oauth-state-sweep", STATE_SWEEP_INTERVAL, cancel, move || {
        let store = Arc::clone(&store);
        let now = clock.now();
        async move { store.sweep(now).await }
    })
}

// =============================================================================
// Provider
// =============================================================================

/// Token endpoint response. Only the access token is used.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Identity returned by the provider's userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderIdentity {
    #[serde(alias = "sub", alias = "id")]
    pub subject: String,
    pub email: String,
    #[serde(default, alias = "verified_email")]
    pub email_verified: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// An OAuth identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short name used to qualify subjects, e.g. `google`.
    fn name(&self) -> &str;

    /// Where to send the browser to start sign-in.
    fn authorization_url(&self, state: &str) -> Result<String, AuthError>;

    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, AuthError>;

    /// Fetch the signed-in identity.
    async fn fetch_identity(&self, token: &ProviderToken) -> Result<ProviderIdentity, AuthError>;
}

/// Google OAuth client settings.
#[derive(Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl GoogleConfig {
    pub fn new(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".into(),
        }
    }
}

/// [`IdentityProvider`] for Google.
#[derive(Debug, Clone)]
pub struct GoogleProvider {
    config: GoogleConfig,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Internal(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn authorization_url(&self, state: &str) -> Result<String, AuthError> {
        let url = Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", "openid email profile"),
                ("state", state),
                ("access_type", "online"),
                ("prompt", "select_account"),
            ],
        )
        .map_err(|e| AuthError::Internal(format!("invalid auth url: {e}")))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];

        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::ExternalService(format!("token exchange failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::ExternalService(format!(
                "token exchange HTTP {status}: {body}"
            )));
        }

        resp.json::<ProviderToken>()
            .await
            .map_err(|e| AuthError::ExternalService(format!("token response parse error: {e}")))
    }

    async fn fetch_identity(&self, token: &ProviderToken) -> Result<ProviderIdentity, AuthError> {
        let resp = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| AuthError::ExternalService(format!("userinfo request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AuthError::ExternalService(format!(
                "userinfo HTTP {}",
                resp.status()
            )));
        }

        resp.json::<ProviderIdentity>()
            .await
            .map_err(|e| AuthError::ExternalService(format!("userinfo parse error: {e}")))
    }
}

// =============================================================================
// Flow
// =============================================================================

/// Store a fresh state and return the provider URL to redirect to.
pub async fn begin_sign_in(
    states: &dyn OAuthStateStore,
    provider: &dyn IdentityProvider,
    redirect_to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String, AuthError> {
    let state = generate_state();
    let url = provider.authorization_url(&state)?;
    states
        .insert(
            state,
            OAuthPendingState {
                redirect_to: sanitize_redirect_target(redirect_to),
                created_at: now,
            },
        )
        .await?;
    Ok(url)
}

/// Result of a completed callback.
#[derive(Debug, Clone)]
pub struct SignInOutcome {
    pub user: User,
    pub redirect_to: String,
}

/// Validate the callback state, exchange the code and resolve the account.
///
/// The state is consumed before anything else happens. An unknown, expired
/// or replayed state fails with [`AuthError::OAuthState`] and the provider is
/// never contacted.
pub async fn complete_sign_in(
    states: &dyn OAuthStateStore,
    provider: &dyn IdentityProvider,
    repo: &dyn AuthRepository,
    state: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<SignInOutcome, AuthError> {
    let Some(pending) = states.take(state, now).await? else {
        warn!(provider = provider.name(), "oauth callback with unknown or expired state");
        return Err(AuthError::OAuthState);
    };
    if code.is_empty() {
        return Err(AuthError::Validation("missing authorization code".into()));
    }

    let token = provider.exchange_code(code).await?;
    let identity = provider.fetch_identity(&token).await?;
    let user = resolve_account(repo, provider.name(), &identity).await?;

    Ok(SignInOutcome {
        user,
        redirect_to: pending.redirect_to,
    })
}

/// Find, link or create the local user for a provider identity.
pub async fn resolve_account(
    repo: &dyn AuthRepository,
    provider_name: &str,
    identity: &ProviderIdentity,
) -> Result<User, AuthError> {
    if !identity.email_verified {
        return Err(AuthError::EmailNotVerified);
    }
    let external_id = format!("{provider_name}:{}", identity.subject);

    if let Some(user) = repo.find_user_by_external_id(&external_id).await? {
        debug!(user_id = %user.id, "oauth sign-in for linked account");
        return Ok(user);
    }

    let email = normalize_email(&identity.email);
    if !valid_email(&email) {
        return Err(AuthError::ExternalService(
            "provider returned a malformed email".into(),
        ));
    }

    if let Some(existing) = repo.find_user_by_email(&email).await? {
        let user = existing.user;
        return match user.external_identity_id.as_deref() {
            Some(other) if other != external_id => Err(AuthError::Conflict(
                "Account is linked to a different external identity".into(),
            )),
            Some(_) => Ok(user),
            None => {
                let linked = repo.link_external_identity(&user.id, &external_id).await?;
                info!(user_id = %linked.id, provider = provider_name, "linked external identity");
                Ok(linked)
            }
        };
    }

    let name = identity
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
    let user = repo
        .create_user(NewUser {
            email,
            name,
            password_hash: None,
            external_identity_id: Some(external_id),
        })
        .await?;
    info!(user_id = %user.id, provider = provider_name, "created account from external identity");
    Ok(user)
}
