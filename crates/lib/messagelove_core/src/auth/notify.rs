//! Delivery seam for password-reset links.
//!
//! Sending email is outside this workspace; the flows hand the issued link to a
//! [`ResetNotifier`] and never surface it in HTTP responses.

use async_trait::async_trait;
use tracing::{info, trace};

use super::AuthError;
use super::reset::IssuedReset;

/// Delivers a freshly issued reset link to the account owner.
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset_link(&self, email: &str, reset: &IssuedReset) -> Result<(), AuthError>;
}

/// Logs that a link was issued. The link itself only appears at trace level.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_reset_link(&self, email: &str, reset: &IssuedReset) -> Result<(), AuthError> {
        info!(
            user_id = %reset.user_id,
            expires_at = %reset.expires_at,
            "password reset link issued"
        );
        trace!(email, reset_url = %reset.reset_url, "password reset link");
        Ok(())
    }
}
