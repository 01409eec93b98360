/// Bpelway: continuation-based business process engine
///
/// Main entry point for the Bpelway server. Loads configuration from the
/// environment and starts the HTTP server.

use bpelway::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Process definition API at /api/processes/*
/// - Instance API at /api/instances/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and ./data/bpelway.db
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
