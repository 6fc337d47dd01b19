//! # messagelove_api
//!
//! HTTP API library for MessageLove auth: registration, login with lockout,
//! password reset, session refresh and Google sign-in.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use messagelove_core::auth::AuthError;
use messagelove_core::auth::jwt::TokenService;
use messagelove_core::auth::lockout::{LockoutGuard, LockoutStore, MemoryLockoutStore};
use messagelove_core::auth::notify::{LogNotifier, ResetNotifier};
use messagelove_core::auth::oauth::{
    GoogleProvider, IdentityProvider, MemoryOAuthStateStore, OAuthStateStore,
};
use messagelove_core::auth::repository::AuthRepository;
use messagelove_core::clock::Clock;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{auth, health, oauth};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub repo: Arc<dyn AuthRepository>,
    pub tokens: TokenService,
    pub lockout: LockoutGuard,
    pub oauth_states: Arc<dyn OAuthStateStore>,
    /// `None` when Google sign-in is not configured.
    pub identity_provider: Option<Arc<dyn IdentityProvider>>,
    pub notifier: Arc<dyn ResetNotifier>,
    pub clock: Clock,
}

impl AppState {
    /// State with in-memory lockout and OAuth stores, the logging notifier and
    /// the system clock. Google sign-in is enabled when configured.
    pub fn new(config: ApiConfig, repo: Arc<dyn AuthRepository>) -> Result<Self, AuthError> {
        let identity_provider = match config.google.clone() {
            Some(google) => {
                Some(Arc::new(GoogleProvider::new(google)?) as Arc<dyn IdentityProvider>)
            }
            None => None,
        };
        let lockout_store: Arc<dyn LockoutStore> = Arc::new(MemoryLockoutStore::new());
        Ok(Self {
            tokens: TokenService::new(config.jwt_secret.as_bytes(), config.token_ttl),
            lockout: LockoutGuard::new(lockout_store, config.lockout),
            oauth_states: Arc::new(MemoryOAuthStateStore::new()),
            identity_provider,
            notifier: Arc::new(LogNotifier),
            clock: Clock::system(),
            repo,
            config,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResetNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    pub fn with_lockout_store(mut self, store: Arc<dyn LockoutStore>) -> Self {
        self.lockout = LockoutGuard::new(store, self.config.lockout);
        self
    }

    pub fn with_oauth_state_store(mut self, store: Arc<dyn OAuthStateStore>) -> Self {
        self.oauth_states = store;
        self
    }
}

/// Run embedded database migrations.
///
/// Delegates to `messagelove_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    messagelove_core::migrate::migrate(pool).await
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    let origin = url::Url::parse(&config.frontend_url)
        .ok()
        .map(|u| u.origin().ascii_serialization())
        .and_then(|o| HeaderValue::from_str(&o).ok());
    match origin {
        Some(origin) => base
            .allow_origin(AllowOrigin::exact(origin))
            .allow_credentials(true),
        None => base.allow_origin(Any),
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public = Router::new()
        .route("/health", get(health::health_handler))
        .route("/auth/register", post(auth::register_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/forgot-password", post(auth::forgot_password_handler))
        .route("/auth/reset-password", post(auth::reset_password_handler))
        .route("/auth/google", get(oauth::google_begin_handler))
        .route("/auth/google/callback", get(oauth::google_callback_handler));

    // Protected routes (require auth)
    let protected = Router::new()
        .route("/auth/refresh", post(auth::refresh_handler))
        .route("/auth/me", get(auth::me_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::errors::sanitize_errors,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .layer(cors_layer(&state.config))
        .with_state(state)
}
