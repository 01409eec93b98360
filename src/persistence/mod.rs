/// Durable storage for process instances
///
/// Schema and read-side queries live in `database`; the transactional write
/// path used by the execution host lives in `transaction`.

pub mod database;
pub mod transaction;

pub use database::{Database, InstanceSummary, StoredInstance};
pub use transaction::{
    ContinuationRecord, ContinuationStorage, MemoryTransactionManager, SqliteTransactionManager, TransactionError,
    TransactionManager, TransactionStatus,
};
