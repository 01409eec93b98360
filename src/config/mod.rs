/// Configuration management for the Bpelway engine
///
/// Handles server configuration, database location, and runtime limits.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Process engine limits
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the engine database (default: "data")
    /// Creates: {data_dir}/bpelway.db
    pub data_dir: String,
}

impl DatabaseConfig {
    /// SQLite connection URL for the engine database
    pub fn database_url(&self) -> String {
        format!("sqlite:{}/bpelway.db?mode=rwc", self.data_dir)
    }
}

/// Limits applied to every execution pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Steps a single pass may run before it is declared a livelock
    pub max_steps_per_pass: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_pass: std::env::var("BPELWAY_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100_000),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("BPELWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("BPELWAY_PORT")
                    .unwrap_or_else(|_| "3004".to_string())
                    .parse()
                    .unwrap_or(3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("BPELWAY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig::default(),
        }
    }
}
