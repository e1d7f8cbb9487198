// Wait-for graph used by the lock table to find deadlocks

use std::collections::{HashMap, HashSet};

use crate::common::types::TxnId;

/// Directed graph of blocked transactions.
///
/// An edge `a -> b` means transaction `a` is waiting for a lock that `b`
/// holds, or that `b` is queued for ahead of `a` with a conflicting mode.
/// Only waiting transactions have outgoing edges.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `waiter`
    pub fn set_edges(&mut self, waiter: TxnId, blockers: HashSet<TxnId>) {
        if blockers.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, blockers);
        }
    }

    /// Drop every outgoing edge of `waiter` (it was granted or gave up)
    pub fn remove_waiter(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Find a cycle passing through `start`.
    ///
    /// Returns the members of the cycle in edge order, starting with `start`.
    pub fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut visited = HashSet::new();
        visited.insert(start);

        if self.search(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn search(
        &self,
        start: TxnId,
        current: TxnId,
        path: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> bool {
        let Some(next) = self.edges.get(&current) else {
            return false;
        };

        // Sorted so that the reported cycle is deterministic
        let mut next: Vec<TxnId> = next.iter().copied().collect();
        next.sort_unstable();

        for txn_id in next {
            if txn_id == start {
                return true;
            }
            if visited.insert(txn_id) {
                path.push(txn_id);
                if self.search(start, txn_id, path, visited) {
                    return true;
                }
                path.pop();
            }
        }

        false
    }
}
