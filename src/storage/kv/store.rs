use std::collections::HashMap;
use std::hash::Hash;
use parking_lot::RwLock;

use crate::storage::kv::error::{Result, StoreError};

/// In-memory store of committed values.
///
/// Every call is atomic for the keys it touches; isolation between
/// transactions is the transaction manager's job, not the store's.
pub struct KeyStore<K, V> {
    entries: RwLock<HashMap<K, V>>,
    capacity: Option<usize>,
}

impl<K, V> KeyStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Create a store that refuses to hold more than `capacity` keys
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Read the committed value for a key
    pub fn read(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Write a single key
    pub fn write(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.write();
        Self::put_checked(&mut entries, self.capacity, key, value)?;
        Ok(())
    }

    /// Read several keys at once. Absent keys are left out of the result.
    pub fn read_all<'a, I>(&self, keys: I) -> HashMap<K, V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let entries = self.entries.read();
        keys.into_iter()
            .filter_map(|key| entries.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    /// Apply a batch of writes as one unit.
    ///
    /// The write lock is held for the whole batch, so no other batch can
    /// interleave with it. If any write fails, the writes already applied
    /// are undone before returning, leaving the store as it was.
    pub fn apply_batch<I>(&self, writes: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut entries = self.entries.write();
        let mut undo: Vec<(K, Option<V>)> = Vec::new();

        for (key, value) in writes {
            match Self::put_checked(&mut entries, self.capacity, key.clone(), value) {
                Ok(previous) => undo.push((key, previous)),
                Err(e) => {
                    for (key, previous) in undo.into_iter().rev() {
                        match previous {
                            Some(value) => {
                                entries.insert(key, value);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(undo.len())
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn put_checked(
        entries: &mut HashMap<K, V>,
        capacity: Option<usize>,
        key: K,
        value: V,
    ) -> Result<Option<V>> {
        if let Some(capacity) = capacity {
            if !entries.contains_key(&key) && entries.len() >= capacity {
                return Err(StoreError::CapacityExceeded { capacity });
            }
        }
        Ok(entries.insert(key, value))
    }
}

impl<K, V> Default for KeyStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
