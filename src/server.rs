/// Server setup and initialization
///
/// Wires together all components: database, definition storage and registry,
/// process engine, and HTTP routes.

use crate::{
    api::{create_instance_routes, create_process_routes, AppState},
    config::Config,
    persistence::Database,
    process::{registry::ProcessRegistry, storage::ProcessStorage},
    runtime::engine::ProcessEngine,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
///
/// Opens the engine database under the configured data directory.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("🗄️ Opening engine database in {}", config.database.data_dir);
    let database = Database::open(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open engine database: {}", e))?;

    create_app_with_database(config, database).await
}

/// Create the application on an already opened database
pub async fn create_app_with_database(config: Config, database: Database) -> Result<Router> {
    tracing::info!("📋 Initializing process storage");
    let storage = ProcessStorage::new(database.pool().clone());

    tracing::info!("📊 Initializing process registry");
    let registry = Arc::new(ProcessRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load processes from storage: {}", e))?;

    tracing::info!("🚀 Initializing process engine");
    let engine = ProcessEngine::new(database, Arc::clone(&registry), config.engine.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize process engine: {}", e))?;
    engine
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start process engine: {}", e))?;

    let app_state = AppState { storage, registry, engine };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_process_routes())
        .merge(create_instance_routes())
        .with_state(app_state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Bpelway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
