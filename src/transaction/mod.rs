// Transactional cache: pessimistic locking over an in-memory key store

pub mod concurrency;

// Public exports
pub use concurrency::{
    IsolationLevel, LockTable, Transaction, TransactionConcurrency, TransactionError,
    TransactionManager, TransactionState,
};
