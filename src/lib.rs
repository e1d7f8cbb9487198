// Transactional key-value cache engine

pub mod common;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::{AtomicityMode, CacheConfig, LockMode, TxnId};
pub use storage::{KeyStore, StoreError};
pub use transaction::{
    IsolationLevel, LockTable, Transaction, TransactionConcurrency, TransactionError,
    TransactionManager, TransactionState,
};
