// Transaction concurrency module exports

pub mod deadlock;
pub mod lock_table;
pub mod transaction;
pub mod transaction_manager;

// Public exports
pub use deadlock::WaitForGraph;
pub use lock_table::{LockError, LockStatus, LockTable};
pub use transaction::{
    IsolationLevel, Transaction, TransactionConcurrency, TransactionError, TransactionState,
};
pub use transaction_manager::TransactionManager;
