use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::common::config::CacheConfig;
use crate::common::types::{LockMode, TxnId};
use crate::storage::kv::{KeyStore, StoreError};
use crate::transaction::concurrency::lock_table::{LockError, LockTable};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Result, Transaction, TransactionConcurrency, TransactionError,
    TransactionState,
};

/// Transaction manager - owns the key store and lock table and runs every
/// transactional operation against them.
///
/// Reads take a shared lock (released at once under read committed, kept
/// until the end under repeatable read). Writes take an exclusive lock that
/// is always kept until commit or rollback, and are buffered in the
/// transaction until commit applies them to the store in one batch.
pub struct TransactionManager<K, V> {
    config: CacheConfig,

    /// Next transaction ID to assign
    next_txn_id: AtomicU64,

    store: KeyStore<K, V>,

    lock_table: LockTable<K>,

    /// Live transactions (txn_id -> isolation level)
    active_transactions: Mutex<HashMap<TxnId, IsolationLevel>>,
}

impl<K, V> TransactionManager<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create a new transaction manager with an empty store
    pub fn new(config: CacheConfig) -> Self {
        let store = KeyStore::with_capacity_limit(config.store_capacity);
        let lock_table = LockTable::new(config.deadlock_check_interval);

        Self {
            config,
            next_txn_id: AtomicU64::new(1), // Start from 1
            store,
            lock_table,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &KeyStore<K, V> {
        &self.store
    }

    pub fn lock_table(&self) -> &LockTable<K> {
        &self.lock_table
    }

    /// Begin a new transaction.
    ///
    /// The returned transaction must be finished with `commit` or
    /// `rollback`; its locks are held until then. Dropping an unfinished
    /// transaction leaks its locks, so prefer `run_in_transaction` where
    /// the work fits in one closure.
    pub fn begin(
        &self,
        concurrency: TransactionConcurrency,
        isolation_level: IsolationLevel,
    ) -> Transaction<K, V> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.active_transactions.lock().insert(txn_id, isolation_level);

        info!(
            "[{}] Started txn {} ({}, {})",
            self.config.name, txn_id, concurrency, isolation_level
        );
        Transaction::new(txn_id, concurrency, isolation_level)
    }

    /// Read `key` inside `txn`
    pub fn get(&self, txn: &mut Transaction<K, V>, key: &K) -> Result<Option<V>> {
        txn.ensure_active()?;

        if !self.config.is_transactional() {
            return Ok(self.store.read(key));
        }

        // Read your own writes
        if let Some(value) = txn.pending_write(key) {
            return Ok(Some(value.clone()));
        }

        if let Some(value) = txn.cached_read(key) {
            return Ok(value.clone());
        }

        self.lock(txn, key.clone(), LockMode::Shared)?;
        let value = self.store.read(key);

        match txn.isolation_level() {
            IsolationLevel::ReadCommitted => {
                if txn.lock_mode(key) == Some(LockMode::Shared) {
                    self.lock_table.release(txn.id(), key);
                    txn.forget_lock(key);
                }
            }
            IsolationLevel::RepeatableRead => {
                txn.cache_read(key.clone(), value.clone());
            }
        }

        Ok(value)
    }

    /// Write `value` to `key` inside `txn`. The write becomes visible to
    /// others only when `txn` commits.
    pub fn put(&self, txn: &mut Transaction<K, V>, key: K, value: V) -> Result<()> {
        txn.ensure_active()?;

        if !self.config.is_transactional() {
            return self
                .store
                .write(key, value)
                .map_err(|source| TransactionError::StoreWriteFailure {
                    txn_id: txn.id(),
                    source,
                });
        }

        self.lock(txn, key.clone(), LockMode::Exclusive)?;
        txn.buffer_write(key, value);
        Ok(())
    }

    /// Commit a transaction.
    ///
    /// Buffered writes are applied to the store as one batch, then every
    /// lock is released. If the store rejects the batch nothing is applied
    /// and the transaction ends rolled back.
    pub fn commit(&self, txn: &mut Transaction<K, V>) -> Result<()> {
        txn.transition(TransactionState::Committing)?;
        let txn_id = txn.id();

        let writes = txn.take_pending_writes();
        let write_count = writes.len();
        if !writes.is_empty() {
            if let Err(source) = self.store.apply_batch(writes) {
                error!(
                    "[{}] Txn {} failed to apply {} writes: {}",
                    self.config.name, txn_id, write_count, source
                );
                self.finish_rollback(txn)?;
                return Err(TransactionError::StoreWriteFailure { txn_id, source });
            }
        }

        let released = self.lock_table.release_all(txn_id);
        txn.clear_locks();
        txn.discard_pending_writes();
        txn.transition(TransactionState::Committed)?;
        self.active_transactions.lock().remove(&txn_id);

        info!(
            "[{}] Committed txn {} ({} writes, {} locks released, {:?})",
            self.config.name,
            txn_id,
            write_count,
            released,
            txn.elapsed()
        );
        Ok(())
    }

    /// Roll back a transaction, discarding its writes and releasing its locks
    pub fn rollback(&self, txn: &mut Transaction<K, V>) -> Result<()> {
        txn.ensure_active()?;
        self.finish_rollback(txn)
    }

    /// Externally abort the blocked lock wait of `txn_id`.
    ///
    /// The blocked `get`/`put` returns `TransactionError::Cancelled`; the
    /// owner of the transaction is expected to roll it back.
    pub fn cancel(&self, txn_id: TxnId) -> bool {
        self.lock_table.cancel(txn_id)
    }

    /// Run `f` in a fresh transaction, committing if it succeeds and rolling
    /// back if it fails. A panic in `f` rolls the transaction back before
    /// it is resumed.
    pub fn run_in_transaction<T, F>(
        &self,
        concurrency: TransactionConcurrency,
        isolation_level: IsolationLevel,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&Self, &mut Transaction<K, V>) -> Result<T>,
    {
        let mut txn = self.begin(concurrency, isolation_level);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self, &mut txn)));

        match outcome {
            Ok(Ok(value)) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if txn.is_active() {
                    self.rollback(&mut txn)?;
                }
                Err(e)
            }
            Err(payload) => {
                error!(
                    "[{}] Txn {} panicked, rolling back",
                    self.config.name,
                    txn.id()
                );
                if txn.is_active() {
                    // The panic is resumed either way
                    let _ = self.rollback(&mut txn);
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Read the committed values of `keys`, outside of any transaction and
    /// without taking locks. Absent keys are left out.
    pub fn get_all<'a, I>(&self, keys: I) -> HashMap<K, V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        self.store.read_all(keys)
    }

    /// Write a committed value directly, outside of any transaction
    pub fn put_initial(&self, key: K, value: V) -> std::result::Result<(), StoreError> {
        self.store.write(key, value)
    }

    /// Check if a transaction is still running
    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.active_transactions.lock().contains_key(&txn_id)
    }

    /// Get all active transaction IDs
    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active_transactions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self, txn: &mut Transaction<K, V>, key: K, mode: LockMode) -> Result<()> {
        let txn_id = txn.id();

        match self
            .lock_table
            .acquire(txn_id, key.clone(), mode, self.config.lock_wait_timeout)
        {
            Ok(()) => {
                txn.record_lock(key, mode);
                Ok(())
            }
            Err(LockError::Deadlock(_)) => {
                warn!(
                    "[{}] Txn {} is a deadlock victim on {:?}, rolling back",
                    self.config.name, txn_id, key
                );
                self.finish_rollback(txn)?;
                Err(TransactionError::Deadlock(txn_id))
            }
            Err(LockError::Timeout(_)) => Err(TransactionError::LockConflictTimeout {
                txn_id,
                key: format!("{:?}", key),
            }),
            Err(LockError::Cancelled(_)) => Err(TransactionError::Cancelled(txn_id)),
            Err(e) => Err(TransactionError::InternalError(e.to_string())),
        }
    }

    /// Drive `txn` from ACTIVE or COMMITTING to ROLLED_BACK
    fn finish_rollback(&self, txn: &mut Transaction<K, V>) -> Result<()> {
        let txn_id = txn.id();
        txn.transition(TransactionState::RollingBack)?;

        txn.discard_pending_writes();
        let released = self.lock_table.release_all(txn_id);
        txn.clear_locks();

        txn.transition(TransactionState::RolledBack)?;
        self.active_transactions.lock().remove(&txn_id);

        debug!("Txn {} released {} locks on rollback", txn_id, released);
        info!("[{}] Rolled back txn {}", self.config.name, txn_id);
        Ok(())
    }
}
