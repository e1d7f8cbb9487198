// Transaction state object
// Tracks lifecycle, held locks, buffered writes and the repeatable-read cache

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use thiserror::Error;

use crate::common::types::{LockMode, TxnId};
use crate::storage::kv::StoreError;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Read locks are dropped right after each read
    ReadCommitted,
    /// Read locks are held until the transaction ends
    RepeatableRead,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "READ_COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE_READ"),
        }
    }
}

/// Transaction concurrency modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionConcurrency {
    /// Locks are taken before data is touched; conflicts block
    #[default]
    Pessimistic,
}

impl fmt::Display for TransactionConcurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionConcurrency::Pessimistic => write!(f, "PESSIMISTIC"),
        }
    }
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// Whether `self -> next` is a legal step of the lifecycle
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction {txn_id} timed out waiting for a lock on {key}")]
    LockConflictTimeout { txn_id: TxnId, key: String },

    #[error("Transaction {0} was rolled back to resolve a deadlock")]
    Deadlock(TxnId),

    #[error("Lock wait of transaction {0} was cancelled")]
    Cancelled(TxnId),

    #[error("Transaction {txn_id} cannot do this in state {state:?}")]
    InvalidState { txn_id: TxnId, state: TransactionState },

    #[error("Transaction {txn_id} failed to write to the store: {source}")]
    StoreWriteFailure {
        txn_id: TxnId,
        #[source]
        source: StoreError,
    },

    #[error("Internal transaction error: {0}")]
    InternalError(String),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Transaction - one unit of work against the cache.
///
/// The caller owns the transaction and passes it to the
/// `TransactionManager` for every operation. Writes stay in
/// `pending_writes` until commit.
pub struct Transaction<K, V> {
    /// Transaction ID
    id: TxnId,

    /// Concurrency mode
    concurrency: TransactionConcurrency,

    /// Isolation level for this transaction
    isolation_level: IsolationLevel,

    /// Current transaction state
    state: TransactionState,

    /// Locks held through the lock table
    held_locks: HashMap<K, LockMode>,

    /// Buffered writes in the order they were made
    pending_writes: LinkedHashMap<K, V>,

    /// Values read under a retained lock (repeatable read only)
    read_cache: HashMap<K, Option<V>>,

    started_at: Instant,
}

impl<K, V> Transaction<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a new active transaction with the given ID
    pub fn new(
        id: TxnId,
        concurrency: TransactionConcurrency,
        isolation_level: IsolationLevel,
    ) -> Self {
        Self {
            id,
            concurrency,
            isolation_level,
            state: TransactionState::Active,
            held_locks: HashMap::new(),
            pending_writes: LinkedHashMap::new(),
            read_cache: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Get transaction ID
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Get transaction state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Get transaction isolation level
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn concurrency(&self) -> TransactionConcurrency {
        self.concurrency
    }

    /// Time since the transaction started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Fail with `InvalidState` unless the transaction is active
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.invalid_state())
        }
    }

    /// Move to `next`, rejecting steps the lifecycle does not allow
    pub fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(self.invalid_state());
        }
        self.state = next;
        Ok(())
    }

    fn invalid_state(&self) -> TransactionError {
        TransactionError::InvalidState {
            txn_id: self.id,
            state: self.state,
        }
    }

    /// Mode of the lock held on `key`, if any
    pub fn lock_mode(&self, key: &K) -> Option<LockMode> {
        self.held_locks.get(key).copied()
    }

    /// Remember a granted lock. A shared grant never downgrades an exclusive one.
    pub fn record_lock(&mut self, key: K, mode: LockMode) {
        let held = self.held_locks.entry(key).or_insert(mode);
        if mode == LockMode::Exclusive {
            *held = LockMode::Exclusive;
        }
    }

    pub fn forget_lock(&mut self, key: &K) {
        self.held_locks.remove(key);
    }

    pub fn held_lock_count(&self) -> usize {
        self.held_locks.len()
    }

    pub fn clear_locks(&mut self) {
        self.held_locks.clear();
    }

    /// Buffer a write until commit
    pub fn buffer_write(&mut self, key: K, value: V) {
        // Re-inserting keeps the first-write position
        if let Some(slot) = self.pending_writes.get_mut(&key) {
            *slot = value;
        } else {
            self.pending_writes.insert(key, value);
        }
    }

    /// Value this transaction wrote to `key`, if any
    pub fn pending_write(&self, key: &K) -> Option<&V> {
        self.pending_writes.get(key)
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Drain the buffered writes in write order
    pub fn take_pending_writes(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.pending_writes).into_iter().collect()
    }

    pub fn discard_pending_writes(&mut self) {
        self.pending_writes.clear();
        self.read_cache.clear();
    }

    /// Value locked in by an earlier read of `key`
    pub fn cached_read(&self, key: &K) -> Option<&Option<V>> {
        self.read_cache.get(key)
    }

    pub fn cache_read(&mut self, key: K, value: Option<V>) {
        self.read_cache.insert(key, value);
    }
}

impl<K, V> Debug for Transaction<K, V>
where
    K: Eq + Hash + Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("concurrency", &self.concurrency)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state)
            .field("held_locks", &self.held_locks)
            .field("pending_writes", &self.pending_writes)
            .finish_non_exhaustive()
    }
}
