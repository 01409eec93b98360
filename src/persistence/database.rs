/// Engine database: schema and read-side queries
///
/// One SQLite database holds:
/// - process_definitions: versioned process definitions as JSON
/// - instances: continuation blob + context per process instance
/// - instance_effects: outbox of effects journaled by committed passes
///
/// Writes to instances and instance_effects only ever happen inside a pass
/// transaction (see [`crate::persistence::transaction`]).

use crate::config::DatabaseConfig;
use crate::runtime::context::{Effect, InstanceContext};
use crate::runtime::host::InstanceStatus;
use crate::runtime::soup::InstanceOutcome;
use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

/// Connection pool wrapper owning the schema
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// A persisted instance row
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub id: Uuid,
    pub process_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub outcome: Option<InstanceOutcome>,
    pub soup: Vec<u8>,
    pub context: InstanceContext,
}

/// Instance listing entry
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub process_id: String,
    pub definition_version: u32,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Database {
    /// Open (creating if missing) the database under the configured data directory
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", config.data_dir, e))?;
        let url = config.database_url();

        tracing::info!("🗄️ Opening engine database: {}", url);

        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database; a single pinned connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables; safe to call multiple times
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                process_id TEXT NOT NULL,
                definition_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                outcome JSON,
                soup BLOB NOT NULL,
                context JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_effects (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                effect JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_effects_instance ON instance_effects(instance_id, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Load one instance with its continuation state
    pub async fn load_instance(&self, id: Uuid) -> Result<Option<StoredInstance>> {
        let row = sqlx::query(
            "SELECT id, process_id, definition_version, status, outcome, soup, context FROM instances WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let outcome: Option<String> = row.get("outcome");
        let context: String = row.get("context");
        let version: i64 = row.get("definition_version");

        Ok(Some(StoredInstance {
            id,
            process_id: row.get("process_id"),
            definition_version: version as u32,
            status: InstanceStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("Instance {} has unknown status '{}'", id, status))?,
            outcome: outcome.map(|o| serde_json::from_str(&o)).transpose()?,
            soup: row.get("soup"),
            context: serde_json::from_str(&context)?,
        }))
    }

    /// List instances, newest first, optionally filtered by status
    pub async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<InstanceSummary>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT id, process_id, definition_version, status, created_at, updated_at \
                     FROM instances WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, process_id, definition_version, status, created_at, updated_at \
                     FROM instances ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut instances = Vec::new();
        for row in rows {
            let version: i64 = row.get("definition_version");
            instances.push(InstanceSummary {
                id: row.get("id"),
                process_id: row.get("process_id"),
                definition_version: version as u32,
                status: row.get("status"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(instances)
    }

    /// Ids of instances that have not reached a terminal state
    pub async fn running_instance_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM instances WHERE status = ?")
            .bind(InstanceStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Uuid::parse_str(&id).map_err(|e| anyhow::anyhow!("Invalid instance id '{}': {}", id, e))
            })
            .collect()
    }

    /// Effects journaled by an instance, in commit order
    pub async fn load_effects(&self, instance_id: Uuid) -> Result<Vec<Effect>> {
        let rows = sqlx::query("SELECT effect FROM instance_effects WHERE instance_id = ? ORDER BY seq")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut effects = Vec::with_capacity(rows.len());
        for row in rows {
            let effect_json: String = row.get("effect");
            effects.push(serde_json::from_str(&effect_json)?);
        }
        Ok(effects)
    }
}
