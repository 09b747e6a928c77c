//! Main Entrypoint for the Cadence API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the durable store (Postgres when configured, memory otherwise).
//! 3. Bootstrapping the session orchestrator from the stored catalogs.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and cancelling session tasks on shutdown.

use anyhow::Context;
use cadence_api::{config::Config, db::PgStore, router::create_router, state::AppState};
use cadence_core::{DurableStore, InMemoryStore, SessionOrchestrator, SystemClock};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Store ---
    let (store, db): (Arc<dyn DurableStore>, Option<Arc<PgStore>>) = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = Arc::new(PgStore::new(pool));
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            let store: Arc<dyn DurableStore> = db.clone();
            (store, Some(db))
        }
        None => {
            warn!("DATABASE_URL not set. Sessions will not survive a restart.");
            let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
            (store, None)
        }
    };

    // --- 4. Bootstrap the Orchestrator ---
    let orchestrator = SessionOrchestrator::bootstrap(
        config.engine_config(),
        store,
        Arc::new(SystemClock::new()),
    )
    .await
    .context("Failed to load session catalogs")?;
    let orchestrator = Arc::new(orchestrator);

    let app_state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        db,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        bind_address = %config.bind_address,
        autosave_secs = config.autosave_interval.as_secs(),
        watchdog_secs = config.watchdog_interval.as_secs(),
        ceiling_secs = config.session_ceiling.as_secs(),
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    orchestrator.shutdown().await;
    info!("Server has shut down.");
    Ok(())
}
