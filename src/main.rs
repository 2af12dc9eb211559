//! Sangha site backend entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sangha::config::SiteConfig;
use sangha::database::DataStore;
use sangha::error::{Result, SiteError};
use sangha::mailer;
use sangha::web;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // RUST_LOG selects levels, e.g. RUST_LOG=sangha=debug
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Sangha starting...");

    let config = SiteConfig::from_env()?;
    tracing::info!(
        port = config.web_port,
        public_url = %config.public_url,
        static_dir = %config.static_dir,
        "Configuration loaded"
    );

    // Connected lazily; requests arriving mid-connect get DATABASE_INITIALIZING
    let store = Arc::new(DataStore::new(config.database_url.clone()));
    let warmup = store.clone();
    tokio::spawn(async move {
        if let Err(e) = warmup.connection().await {
            tracing::error!(error = %e, "Initial database connection failed");
        }
    });

    let mailer = mailer::from_config(&config);
    let web_port = config.web_port;
    let state = web::AppState::new(config, store.clone(), mailer);

    // One-time code cleanup task (runs every hour)
    let otp = state.otp.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let tracked = otp.prune_limiter();
            match otp.purge_stale().await {
                Ok(count) => {
                    tracing::debug!(purged = count, tracked_emails = tracked, "Cleaned up one-time codes");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to clean up one-time codes");
                }
            }
        }
    });

    let router = web::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], web_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SiteError::Config(format!("Failed to bind port {}: {}", web_port, e)))?;
    tracing::info!(port = web_port, "Web server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| SiteError::Internal(format!("Web server error: {}", e)))?;

    store.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
