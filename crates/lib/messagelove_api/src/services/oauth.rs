//! Google sign-in service.

use std::sync::Arc;

use messagelove_core::auth::AuthError;
use messagelove_core::auth::oauth::{self, IdentityProvider};
use tracing::info;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::models::AuthResponse;
use crate::services::auth::issue_session;

/// Callback query as received from the provider.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set when the user denied consent or the provider failed.
    pub error: Option<String>,
}

/// Session minted at the end of a successful callback.
#[derive(Debug, Clone)]
pub struct OAuthSession {
    pub session: AuthResponse,
    pub redirect_to: String,
}

fn provider(state: &AppState) -> AppResult<Arc<dyn IdentityProvider>> {
    state
        .identity_provider
        .clone()
        .ok_or_else(|| AppError::Validation("Google sign-in is not configured".into()))
}

/// Start sign-in and return the provider authorization URL.
pub async fn begin(state: &AppState, redirect_to: Option<&str>) -> AppResult<String> {
    let provider = provider(state)?;
    let url = oauth::begin_sign_in(
        state.oauth_states.as_ref(),
        provider.as_ref(),
        redirect_to,
        state.clock.now(),
    )
    .await?;
    Ok(url)
}

/// Finish sign-in: validate state, exchange the code, resolve the account and
/// mint a session.
pub async fn complete(state: &AppState, params: CallbackParams) -> AppResult<OAuthSession> {
    let provider = provider(state)?;
    let now = state.clock.now();

    if let Some(error) = params.error {
        // States are single-use even when the provider reports an error.
        if let Some(s) = params.state.as_deref() {
            state.oauth_states.take(s, now).await?;
        }
        return Err(AppError::Validation(format!("provider returned error: {error}")));
    }

    let state_param = params.state.ok_or(AuthError::OAuthState)?;
    let code = params.code.unwrap_or_default();
    let outcome = oauth::complete_sign_in(
        state.oauth_states.as_ref(),
        provider.as_ref(),
        state.repo.as_ref(),
        &state_param,
        &code,
        now,
    )
    .await?;

    info!(user_id = %outcome.user.id, provider = provider.name(), "oauth sign-in succeeded");
    Ok(OAuthSession {
        session: issue_session(state, outcome.user)?,
        redirect_to: outcome.redirect_to,
    })
}
