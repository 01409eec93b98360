/// Transaction management and continuation storage
///
/// The execution host brackets every pass with begin/commit (or rollback)
/// on a [`TransactionManager`] and writes the instance's new continuation
/// state plus its journaled effects through [`ContinuationStorage`] inside
/// that same transaction. Either everything a pass did becomes durable, or
/// nothing does.

use crate::runtime::context::{Effect, InstanceContext};
use crate::runtime::host::InstanceStatus;
use crate::runtime::soup::InstanceOutcome;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of the current transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    NoTransaction,
    Active,
    /// Only rollback is allowed from here
    MarkedRollback,
    Committed,
    RolledBack,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("a transaction is already active")]
    AlreadyActive,

    #[error("no active transaction")]
    NotActive,

    #[error("transaction is marked rollback-only")]
    RollbackOnly,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("injected failure: {0}")]
    Injected(&'static str),
}

/// Begin/commit/rollback over the durable store
#[async_trait]
pub trait TransactionManager: Send {
    async fn begin(&mut self) -> Result<(), TransactionError>;
    async fn commit(&mut self) -> Result<(), TransactionError>;
    async fn rollback(&mut self) -> Result<(), TransactionError>;
    fn status(&self) -> TransactionStatus;
    /// Force the current transaction to end in rollback
    fn set_rollback_only(&mut self) -> Result<(), TransactionError>;
}

/// Durable state of one instance as written at the end of a pass
#[derive(Debug, Clone)]
pub struct ContinuationRecord {
    pub instance_id: Uuid,
    pub process_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub outcome: Option<InstanceOutcome>,
    /// Serialized continuation store blob
    pub soup: Vec<u8>,
    pub context: InstanceContext,
}

/// Writes that must land inside the pass transaction
#[async_trait]
pub trait ContinuationStorage: Send {
    async fn write_continuation(&mut self, record: &ContinuationRecord) -> Result<(), TransactionError>;
    async fn write_effects(&mut self, instance_id: Uuid, effects: &[Effect]) -> Result<(), TransactionError>;
}

// ----- SQLite ---------------------------------------------------------------

/// SQLite-backed transaction manager for one pass at a time
pub struct SqliteTransactionManager {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    status: TransactionStatus,
}

impl SqliteTransactionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tx: None,
            status: TransactionStatus::NoTransaction,
        }
    }
}

#[async_trait]
impl TransactionManager for SqliteTransactionManager {
    async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.tx.is_some() {
            return Err(TransactionError::AlreadyActive);
        }
        self.tx = Some(self.pool.begin().await?);
        self.status = TransactionStatus::Active;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if self.status == TransactionStatus::MarkedRollback {
            return Err(TransactionError::RollbackOnly);
        }
        let tx = self.tx.take().ok_or(TransactionError::NotActive)?;
        tx.commit().await?;
        self.status = TransactionStatus::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        let tx = self.tx.take().ok_or(TransactionError::NotActive)?;
        tx.rollback().await?;
        self.status = TransactionStatus::RolledBack;
        Ok(())
    }

    fn status(&self) -> TransactionStatus {
        self.status
    }

    fn set_rollback_only(&mut self) -> Result<(), TransactionError> {
        if self.tx.is_none() {
            return Err(TransactionError::NotActive);
        }
        self.status = TransactionStatus::MarkedRollback;
        Ok(())
    }
}

#[async_trait]
impl ContinuationStorage for SqliteTransactionManager {
    async fn write_continuation(&mut self, record: &ContinuationRecord) -> Result<(), TransactionError> {
        let tx = self.tx.as_mut().ok_or(TransactionError::NotActive)?;
        let context_json = serde_json::to_string(&record.context)?;
        let outcome_json = record.outcome.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO instances (id, process_id, definition_version, status, outcome, soup, context, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                outcome = excluded.outcome,
                soup = excluded.soup,
                context = excluded.context,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(record.instance_id.to_string())
        .bind(&record.process_id)
        .bind(record.definition_version as i64)
        .bind(record.status.as_str())
        .bind(outcome_json)
        .bind(&record.soup)
        .bind(&context_json)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn write_effects(&mut self, instance_id: Uuid, effects: &[Effect]) -> Result<(), TransactionError> {
        let tx = self.tx.as_mut().ok_or(TransactionError::NotActive)?;
        for effect in effects {
            let effect_json = serde_json::to_string(effect)?;
            sqlx::query("INSERT INTO instance_effects (instance_id, effect) VALUES (?, ?)")
                .bind(instance_id.to_string())
                .bind(&effect_json)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

// ----- in-memory ------------------------------------------------------------

/// In-memory transaction manager with staged writes and failure injection
///
/// Writes are staged while a transaction is active and only applied to
/// `records`/`effects` on commit.
#[derive(Debug)]
pub struct MemoryTransactionManager {
    status: TransactionStatus,
    staged_records: Vec<ContinuationRecord>,
    staged_effects: Vec<(Uuid, Effect)>,
    records: HashMap<Uuid, ContinuationRecord>,
    effects: Vec<(Uuid, Effect)>,
    fail_next_commit: bool,
    fail_next_write: bool,
    veto_next_write: bool,
    commits: usize,
    rollbacks: usize,
}

impl Default for MemoryTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransactionManager {
    pub fn new() -> Self {
        Self {
            status: TransactionStatus::NoTransaction,
            staged_records: Vec::new(),
            staged_effects: Vec::new(),
            records: HashMap::new(),
            effects: Vec::new(),
            fail_next_commit: false,
            fail_next_write: false,
            veto_next_write: false,
            commits: 0,
            rollbacks: 0,
        }
    }

    /// Make the next commit fail after the pass ran
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    /// Make the next continuation write fail
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    /// Mark the transaction rollback-only during the next continuation write
    pub fn veto_next_write(&mut self) {
        self.veto_next_write = true;
    }

    pub fn record(&self, instance_id: Uuid) -> Option<&ContinuationRecord> {
        self.records.get(&instance_id)
    }

    pub fn effects(&self) -> &[(Uuid, Effect)] {
        &self.effects
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    fn ensure_active(&self) -> Result<(), TransactionError> {
        match self.status {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => Ok(()),
            _ => Err(TransactionError::NotActive),
        }
    }
}

#[async_trait]
impl TransactionManager for MemoryTransactionManager {
    async fn begin(&mut self) -> Result<(), TransactionError> {
        if matches!(self.status, TransactionStatus::Active | TransactionStatus::MarkedRollback) {
            return Err(TransactionError::AlreadyActive);
        }
        self.status = TransactionStatus::Active;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedRollback => return Err(TransactionError::RollbackOnly),
            _ => return Err(TransactionError::NotActive),
        }
        if std::mem::take(&mut self.fail_next_commit) {
            return Err(TransactionError::Injected("commit"));
        }
        for record in self.staged_records.drain(..) {
            self.records.insert(record.instance_id, record);
        }
        self.effects.append(&mut self.staged_effects);
        self.status = TransactionStatus::Committed;
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.staged_records.clear();
        self.staged_effects.clear();
        self.status = TransactionStatus::RolledBack;
        self.rollbacks += 1;
        Ok(())
    }

    fn status(&self) -> TransactionStatus {
        self.status
    }

    fn set_rollback_only(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.status = TransactionStatus::MarkedRollback;
        Ok(())
    }
}

#[async_trait]
impl ContinuationStorage for MemoryTransactionManager {
    async fn write_continuation(&mut self, record: &ContinuationRecord) -> Result<(), TransactionError> {
        self.ensure_active()?;
        if std::mem::take(&mut self.fail_next_write) {
            return Err(TransactionError::Injected("write"));
        }
        if std::mem::take(&mut self.veto_next_write) {
            self.status = TransactionStatus::MarkedRollback;
        }
        self.staged_records.push(record.clone());
        Ok(())
    }

    async fn write_effects(&mut self, instance_id: Uuid, effects: &[Effect]) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.staged_effects
            .extend(effects.iter().cloned().map(|effect| (instance_id, effect)));
        Ok(())
    }
}
