//! API server configuration.

use chrono::Duration;
use messagelove_core::auth::jwt::{DEFAULT_TOKEN_TTL_SECS, resolve_jwt_secret};
use messagelove_core::auth::lockout::LockoutPolicy;
use messagelove_core::auth::oauth::GoogleConfig;
use messagelove_core::auth::reset::{DEFAULT_RESET_TOKEN_TTL_SECS, ResetPolicy};
use tracing::warn;

/// Deployment environment. Production hides internal error detail and marks
/// cookies `Secure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Configuration for the API server.
#[derive(Clone)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL. `None` selects the in-memory repository.
    pub database_url: Option<String>,
    /// JWT signing secret.
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub reset_token_ttl: Duration,
    /// Frontend origin used for reset links and OAuth redirects.
    pub frontend_url: String,
    /// Google sign-in; `None` disables `/auth/google`.
    pub google: Option<GoogleConfig>,
    pub lockout: LockoutPolicy,
    /// Read the client IP from `X-Forwarded-For` / `X-Real-IP`. Only enable
    /// behind a proxy that overwrites these headers.
    pub trust_proxy_headers: bool,
    pub environment: Environment,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("reset_token_ttl", &self.reset_token_ttl)
            .field("frontend_url", &self.frontend_url)
            .field("google", &self.google)
            .field("lockout", &self.lockout)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .field("environment", &self.environment)
            .finish()
    }
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                | Default                           |
    /// |-------------------------|-----------------------------------|
    /// | `BIND_ADDR`             | `127.0.0.1:3100`                  |
    /// | `DATABASE_URL`          | unset (in-memory repository)      |
    /// | `JWT_SECRET`            | generated & persisted to file     |
    /// | `TOKEN_TTL_SECS`        | `86400`                           |
    /// | `RESET_TOKEN_TTL_SECS`  | `900`                             |
    /// | `FRONTEND_URL`          | `http://localhost:3000`           |
    /// | `GOOGLE_CLIENT_ID`      | unset (Google sign-in disabled)   |
    /// | `GOOGLE_CLIENT_SECRET`  | unset                             |
    /// | `GOOGLE_REDIRECT_URI`   | `{BIND_ADDR}/auth/google/callback`|
    /// | `LOCKOUT_WINDOW_SECS`   | `900`                             |
    /// | `LOCKOUT_MAX_ATTEMPTS`  | `5`                               |
    /// | `LOCKOUT_DURATION_SECS` | `900`                             |
    /// | `TRUST_PROXY_HEADERS`   | `false`                           |
    /// | `APP_ENV`               | `development`                     |
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3100".into());
        let defaults = LockoutPolicy::default();
        let google = match (
            non_empty_var("GOOGLE_CLIENT_ID"),
            non_empty_var("GOOGLE_CLIENT_SECRET"),
        ) {
            (Some(id), Some(secret)) => {
                let redirect_uri = non_empty_var("GOOGLE_REDIRECT_URI")
                    .unwrap_or_else(|| format!("http://{bind_addr}/auth/google/callback"));
                Some(GoogleConfig::new(id, secret, redirect_uri))
            }
            (None, None) => None,
            _ => {
                warn!("GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET must both be set; Google sign-in disabled");
                None
            }
        };

        Self {
            database_url: non_empty_var("DATABASE_URL"),
            jwt_secret: resolve_jwt_secret(),
            token_ttl: env_secs("TOKEN_TTL_SECS", Duration::seconds(DEFAULT_TOKEN_TTL_SECS)),
            reset_token_ttl: env_secs(
                "RESET_TOKEN_TTL_SECS",
                Duration::seconds(DEFAULT_RESET_TOKEN_TTL_SECS),
            ),
            frontend_url: non_empty_var("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:3000".into()),
            google,
            lockout: LockoutPolicy {
                window: env_secs("LOCKOUT_WINDOW_SECS", defaults.window),
                max_attempts: env_parse("LOCKOUT_MAX_ATTEMPTS", defaults.max_attempts),
                lockout_duration: env_secs("LOCKOUT_DURATION_SECS", defaults.lockout_duration),
                sweep_interval: defaults.sweep_interval,
            },
            trust_proxy_headers: env_parse("TRUST_PROXY_HEADERS", false),
            environment: Environment::parse(&std::env::var("APP_ENV").unwrap_or_default()),
            bind_addr,
        }
    }

    /// Development defaults with an explicit secret. Used by tests and tools.
    pub fn for_testing(jwt_secret: &str) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            database_url: None,
            jwt_secret: jwt_secret.into(),
            token_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            reset_token_ttl: Duration::seconds(DEFAULT_RESET_TOKEN_TTL_SECS),
            frontend_url: "http://localhost:3000".into(),
            google: None,
            lockout: LockoutPolicy::default(),
            trust_proxy_headers: false,
            environment: Environment::Development,
        }
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        ResetPolicy {
            ttl: self.reset_token_ttl,
            frontend_url: self.frontend_url.clone(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Longest accepted duration setting: one year.
const MAX_DURATION_SECS: i64 = 365 * 24 * 60 * 60;

/// A whole-seconds duration setting, or `default` when unset.
fn env_secs(key: &str, default: Duration) -> Duration {
    secs_setting(key, non_empty_var(key).as_deref(), default)
}

/// Parse `raw` as seconds in `1..=MAX_DURATION_SECS`. Anything else is logged
/// and replaced by `default`.
fn secs_setting(key: &str, raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(secs) if (1..=MAX_DURATION_SECS).contains(&secs) => {
            Duration::try_seconds(secs).unwrap_or(default)
        }
        Ok(secs) => {
            warn!(key, secs, max = MAX_DURATION_SECS, "duration setting out of range, using default");
            default
        }
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match non_empty_var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}
