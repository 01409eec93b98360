/// SQLite persistence layer for process definitions
///
/// Definitions are stored as JSON with their name and version in indexed
/// columns. Every save bumps the version so running instances can detect
/// that the definition they were started from has changed.

use crate::process::types::ProcessDefinition;
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

/// SQLite-based process definition storage
#[derive(Debug, Clone)]
pub struct ProcessStorage {
    pool: SqlitePool,
}

impl ProcessStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a definition, assigning the next version number
    ///
    /// Returns the stored version.
    pub async fn save_process(&self, definition: &ProcessDefinition) -> Result<u32> {
        let current: Option<i64> = sqlx::query("SELECT version FROM process_definitions WHERE id = ?")
            .bind(&definition.id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("version"));
        let version = current.map_or(1, |v| v as u32 + 1);

        let mut stored = definition.clone();
        stored.version = version;
        let definition_json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO process_definitions (id, name, version, definition, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.name)
        .bind(version as i64)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(version)
    }

    /// Retrieve a definition by id (unlinked)
    pub async fn get_process(&self, id: &str) -> Result<Option<ProcessDefinition>> {
        let row = sqlx::query("SELECT definition FROM process_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List all definitions with basic metadata
    pub async fn list_processes(&self) -> Result<Vec<ProcessMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, version, created_at, updated_at FROM process_definitions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut processes = Vec::new();
        for row in rows {
            let version: i64 = row.get("version");
            processes.push(ProcessMetadata {
                id: row.get("id"),
                name: row.get("name"),
                version: version as u32,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(processes)
    }

    /// Load all definitions for registry initialization
    pub async fn load_all_processes(&self) -> Result<HashMap<String, ProcessDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM process_definitions")
            .fetch_all(&self.pool)
            .await?;

        let mut processes = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            processes.insert(id, serde_json::from_str(&definition_json)?);
        }

        Ok(processes)
    }

    pub async fn delete_process(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM process_definitions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Basic definition metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct ProcessMetadata {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub created_at: String,
    pub updated_at: String,
}
