//! MessageLove auth API server binary.
//!
//! Serves the auth API over HTTP. With `DATABASE_URL` set, users and reset
//! tokens live in PostgreSQL; without it, in process memory.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use messagelove_api::config::ApiConfig;
use messagelove_core::auth::memory::MemoryAuthRepository;
use messagelove_core::auth::oauth::spawn_state_sweeper;
use messagelove_core::auth::repository::{AuthRepository, PgAuthRepository};
use messagelove_core::auth::reset;
use messagelove_core::tasks::spawn_periodic;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often expired reset tokens are purged.
const RESET_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "messagelove_server", about = "MessageLove auth API server")]
struct Args {
    /// Address to listen on. Overrides `BIND_ADDR`.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// PostgreSQL connection URL. Omit to run with the in-memory repository.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,messagelove_api=debug,messagelove_core=debug"))?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let args = Args::parse();
    let mut config = ApiConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    config.database_url = args.database_url.or(config.database_url);

    info!(
        bind_addr = %config.bind_addr,
        environment = ?config.environment,
        google = config.google.is_some(),
        "starting messagelove_server"
    );

    let repo: Arc<dyn AuthRepository> = match config.database_url.as_deref() {
        Some(url) => {
            info!(max_connections = args.max_connections, "configuring connection pool");
            let pool = PgPoolOptions::new()
                .max_connections(args.max_connections)
                .acquire_timeout(std::time::Duration::from_secs(30))
                .connect(url)
                .await?;

            info!("running database migrations");
            messagelove_api::migrate(&pool).await?;
            Arc::new(PgAuthRepository::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; accounts are kept in memory and lost on restart");
            Arc::new(MemoryAuthRepository::new())
        }
    };

    let state = messagelove_api::AppState::new(config.clone(), repo.clone())?;

    // Lockout and OAuth state are process-local; run a single instance or
    // swap in shared stores.
    let cancel = CancellationToken::new();
    let sweepers = vec![
        state.lockout.spawn_sweeper(state.clock.clone(), cancel.clone()),
        spawn_state_sweeper(state.oauth_states.clone(), state.clock.clone(), cancel.clone()),
        spawn_periodic("reset-token-purge", RESET_PURGE_INTERVAL, cancel.clone(), {
            let repo = repo.clone();
            let clock = state.clock.clone();
            move || {
                let repo = repo.clone();
                let now = clock.now();
                async move {
                    reset::purge_expired(repo.as_ref(), now)
                        .await
                        .map(|n| n as usize)
                }
            }
        }),
    ];

    let app = messagelove_api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await;

    cancel.cancel();
    for handle in sweepers {
        let _ = handle.await;
    }
    info!("server stopped");

    serve_result?;
    Ok(())
}

/// Resolves on Ctrl-C or when `cancel` fires.
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "could not listen for shutdown signal");
                cancel.cancelled().await;
            }
            info!("shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }
}
