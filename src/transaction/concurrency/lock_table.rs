// Per-key lock table with FIFO wait queues and deadlock detection

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{LockMode, TxnId};
use crate::transaction::concurrency::deadlock::WaitForGraph;

/// Errors returned by blocking lock operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Transaction {0} was chosen as deadlock victim")]
    Deadlock(TxnId),

    #[error("Transaction {0} timed out waiting for a lock")]
    Timeout(TxnId),

    #[error("Lock wait of transaction {0} was cancelled")]
    Cancelled(TxnId),

    #[error("Transaction {0} is not waiting for a lock")]
    NotWaiting(TxnId),

    #[error("Transaction {0} is already waiting for a lock")]
    AlreadyWaiting(TxnId),
}

/// Result type for lock table operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Outcome of a non-blocking lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is held by the requester
    Granted,
    /// The request is queued; call `wait_for_grant` to park until resolved
    Blocked,
    /// Queuing would close a cycle and the requester is the victim
    Deadlock,
}

/// How a queued request was resolved by another thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Granted,
    Deadlock,
    Cancelled,
}

impl Verdict {
    fn into_result(self, txn_id: TxnId) -> Result<()> {
        match self {
            Verdict::Granted => Ok(()),
            Verdict::Deadlock => Err(LockError::Deadlock(txn_id)),
            Verdict::Cancelled => Err(LockError::Cancelled(txn_id)),
        }
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    upgrade: bool,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TxnId, LockMode>,
    queue: VecDeque<LockRequest>,
}

impl LockEntry {
    /// Whether `txn_id` could hold `mode` next to the current holders
    fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(&holder, &held)| holder == txn_id || held.is_compatible_with(mode))
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// A parked requester. Each one has its own condition variable so a release
/// only wakes the transactions it actually grants.
struct Waiter<K> {
    key: K,
    signal: Arc<Condvar>,
    verdict: Option<Verdict>,
}

struct LockTableState<K> {
    entries: HashMap<K, LockEntry>,
    held: HashMap<TxnId, HashSet<K>>,
    waiters: HashMap<TxnId, Waiter<K>>,
    graph: WaitForGraph,
}

impl<K> LockTableState<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn request(&mut self, txn_id: TxnId, key: K, mode: LockMode) -> Result<LockStatus> {
        if self.waiters.contains_key(&txn_id) {
            return Err(LockError::AlreadyWaiting(txn_id));
        }

        let entry = self.entries.entry(key.clone()).or_default();
        let current = entry.holders.get(&txn_id).copied();

        // Re-entrant request
        if current.is_some_and(|held| held.covers(mode)) {
            return Ok(LockStatus::Granted);
        }

        let upgrade = current.is_some();
        if entry.can_grant(txn_id, mode) && (upgrade || entry.queue.is_empty()) {
            entry.holders.insert(txn_id, mode);
            self.held.entry(txn_id).or_default().insert(key.clone());
            debug!("Granted {:?} lock on {:?} to txn {}", mode, key, txn_id);
            return Ok(LockStatus::Granted);
        }

        let request = LockRequest { txn_id, mode, upgrade };
        if upgrade {
            // Upgrades go ahead of ordinary waiters, behind earlier upgrades
            let pos = entry.queue.iter().take_while(|r| r.upgrade).count();
            entry.queue.insert(pos, request);
        } else {
            entry.queue.push_back(request);
        }

        self.waiters.insert(
            txn_id,
            Waiter {
                key: key.clone(),
                signal: Arc::new(Condvar::new()),
                verdict: None,
            },
        );
        self.refresh_edges(&key);
        debug!("Txn {} blocked on {:?} lock for {:?}", txn_id, mode, key);

        if self.resolve_deadlock(txn_id) {
            self.waiters.remove(&txn_id);
            return Ok(LockStatus::Deadlock);
        }

        Ok(LockStatus::Blocked)
    }

    /// Grant queued requests from the head of the queue while they are
    /// compatible with the holders. Consecutive shared requests are granted
    /// together; an exclusive one is granted alone.
    fn grant_waiters(&mut self, key: &K) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };

        let mut granted = Vec::new();
        loop {
            let grantable = entry
                .queue
                .front()
                .is_some_and(|r| entry.can_grant(r.txn_id, r.mode));
            if !grantable {
                break;
            }
            let Some(request) = entry.queue.pop_front() else {
                break;
            };
            entry.holders.insert(request.txn_id, request.mode);
            granted.push(request.txn_id);
            if request.mode == LockMode::Exclusive {
                break;
            }
        }

        for txn_id in granted {
            self.held.entry(txn_id).or_default().insert(key.clone());
            self.graph.remove_waiter(txn_id);
            if let Some(waiter) = self.waiters.get_mut(&txn_id) {
                waiter.verdict = Some(Verdict::Granted);
                waiter.signal.notify_one();
            }
            debug!("Granted queued lock on {:?} to txn {}", key, txn_id);
        }
    }

    /// Recompute the wait-for edges of every request queued on `key`
    fn refresh_edges(&mut self, key: &K) {
        let Some(entry) = self.entries.get(key) else {
            return;
        };

        for (pos, request) in entry.queue.iter().enumerate() {
            let mut blockers: HashSet<TxnId> = entry
                .holders
                .iter()
                .filter(|&(&holder, &held)| {
                    holder != request.txn_id && !held.is_compatible_with(request.mode)
                })
                .map(|(&holder, _)| holder)
                .collect();

            blockers.extend(
                entry
                    .queue
                    .iter()
                    .take(pos)
                    .filter(|ahead| {
                        ahead.txn_id != request.txn_id
                            && !ahead.mode.is_compatible_with(request.mode)
                    })
                    .map(|ahead| ahead.txn_id),
            );

            self.graph.set_edges(request.txn_id, blockers);
        }
    }

    /// Look for a cycle through `txn_id`. The most recently started member
    /// of the cycle is aborted. Returns true if that is `txn_id` itself.
    fn resolve_deadlock(&mut self, txn_id: TxnId) -> bool {
        let Some(cycle) = self.graph.find_cycle(txn_id) else {
            return false;
        };

        let victim = cycle.iter().copied().max().unwrap_or(txn_id);
        warn!("Deadlock detected among {:?}, victim is txn {}", cycle, victim);
        self.abort_waiter(victim, Verdict::Deadlock);

        victim == txn_id
    }

    /// Take a pending request out of its queue and wake its thread with
    /// `verdict`. Returns false if `txn_id` had no unresolved request.
    fn abort_waiter(&mut self, txn_id: TxnId, verdict: Verdict) -> bool {
        let key = match self.waiters.get(&txn_id) {
            Some(waiter) if waiter.verdict.is_none() => waiter.key.clone(),
            _ => return false,
        };

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.queue.retain(|r| r.txn_id != txn_id);
        }
        self.graph.remove_waiter(txn_id);

        if let Some(waiter) = self.waiters.get_mut(&txn_id) {
            waiter.verdict = Some(verdict);
            waiter.signal.notify_one();
        }

        self.settle(&key);
        true
    }

    fn release_key(&mut self, txn_id: TxnId, key: &K) -> bool {
        let released = self
            .entries
            .get_mut(key)
            .is_some_and(|entry| entry.holders.remove(&txn_id).is_some());

        if let Some(keys) = self.held.get_mut(&txn_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.held.remove(&txn_id);
            }
        }

        if released {
            debug!("Txn {} released lock on {:?}", txn_id, key);
            self.settle(key);
        }
        released
    }

    /// Re-evaluate a key after its holders or queue changed
    fn settle(&mut self, key: &K) {
        self.grant_waiters(key);
        self.refresh_edges(key);
        if self.entries.get(key).is_some_and(LockEntry::is_unused) {
            self.entries.remove(key);
        }
    }
}

/// Lock table - shared/exclusive locks per key
pub struct LockTable<K> {
    state: Mutex<LockTableState<K>>,
    deadlock_check_interval: Duration,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a lock table. Blocked requesters re-run deadlock detection
    /// every `deadlock_check_interval`.
    pub fn new(deadlock_check_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LockTableState {
                entries: HashMap::new(),
                held: HashMap::new(),
                waiters: HashMap::new(),
                graph: WaitForGraph::new(),
            }),
            deadlock_check_interval,
        }
    }

    /// Request a lock without parking.
    ///
    /// On `Blocked` the request stays queued and the caller must follow up
    /// with `wait_for_grant` (or `cancel`).
    pub fn try_acquire(&self, txn_id: TxnId, key: K, mode: LockMode) -> Result<LockStatus> {
        self.state.lock().request(txn_id, key, mode)
    }

    /// Park until the queued request of `txn_id` is granted, chosen as a
    /// deadlock victim, cancelled, or `timeout` expires.
    pub fn wait_for_grant(&self, txn_id: TxnId, timeout: Option<Duration>) -> Result<()> {
        // A timeout too large to add to now is no deadline at all
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.state.lock();

        if !guard.waiters.contains_key(&txn_id) {
            return Err(LockError::NotWaiting(txn_id));
        }

        loop {
            let state = &mut *guard;
            let (verdict, signal) = match state.waiters.get(&txn_id) {
                Some(waiter) => (waiter.verdict, waiter.signal.clone()),
                // Dropped by release_all
                None => return Err(LockError::Cancelled(txn_id)),
            };

            if let Some(verdict) = verdict {
                state.waiters.remove(&txn_id);
                return verdict.into_result(txn_id);
            }

            let mut wait = self.deadlock_check_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    state.abort_waiter(txn_id, Verdict::Cancelled);
                    state.waiters.remove(&txn_id);
                    warn!("Txn {} timed out waiting for a lock", txn_id);
                    return Err(LockError::Timeout(txn_id));
                }
                wait = wait.min(deadline - now);
            }

            signal.wait_for(&mut guard, wait);

            // Periodic check: edges may have changed while we slept
            let state = &mut *guard;
            let unresolved = state
                .waiters
                .get(&txn_id)
                .is_some_and(|waiter| waiter.verdict.is_none());
            if unresolved {
                state.resolve_deadlock(txn_id);
            }
        }
    }

    /// Acquire a lock, parking the calling thread while it conflicts
    pub fn acquire(
        &self,
        txn_id: TxnId,
        key: K,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match self.try_acquire(txn_id, key, mode)? {
            LockStatus::Granted => Ok(()),
            LockStatus::Deadlock => Err(LockError::Deadlock(txn_id)),
            LockStatus::Blocked => self.wait_for_grant(txn_id, timeout),
        }
    }

    /// Release one lock held by `txn_id`. Returns false if it held none.
    pub fn release(&self, txn_id: TxnId, key: &K) -> bool {
        self.state.lock().release_key(txn_id, key)
    }

    /// Release every lock held by `txn_id` and drop any request it still
    /// has queued. Returns the number of locks released.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.abort_waiter(txn_id, Verdict::Cancelled);
        state.waiters.remove(&txn_id);

        let keys = state.held.remove(&txn_id).unwrap_or_default();
        let mut released = 0;
        for key in keys {
            let removed = state
                .entries
                .get_mut(&key)
                .is_some_and(|entry| entry.holders.remove(&txn_id).is_some());
            if removed {
                released += 1;
                state.settle(&key);
            }
        }

        debug!("Txn {} released {} locks", txn_id, released);
        released
    }

    /// Cancel the pending request of `txn_id`, waking it with
    /// `LockError::Cancelled`. Returns false if it was not waiting.
    pub fn cancel(&self, txn_id: TxnId) -> bool {
        let cancelled = self.state.lock().abort_waiter(txn_id, Verdict::Cancelled);
        if cancelled {
            warn!("Cancelled lock wait of txn {}", txn_id);
        }
        cancelled
    }

    /// Current holders of `key`, ordered by transaction id
    pub fn holders(&self, key: &K) -> Vec<(TxnId, LockMode)> {
        let state = self.state.lock();
        let mut holders: Vec<(TxnId, LockMode)> = state
            .entries
            .get(key)
            .map(|entry| entry.holders.iter().map(|(&id, &mode)| (id, mode)).collect())
            .unwrap_or_default();
        holders.sort_unstable_by_key(|&(id, _)| id);
        holders
    }

    /// Whether `txn_id` has a request queued that is not yet resolved
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        let state = self.state.lock();
        state
            .waiters
            .get(&txn_id)
            .is_some_and(|waiter| waiter.verdict.is_none())
    }

    /// Number of requests currently queued
    pub fn waiting_count(&self) -> usize {
        let state = self.state.lock();
        state.entries.values().map(|entry| entry.queue.len()).sum()
    }

    /// Number of keys with at least one holder
    pub fn lock_count(&self) -> usize {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| !entry.holders.is_empty())
            .count()
    }
}
