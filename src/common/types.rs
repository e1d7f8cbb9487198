/// Transaction ID type.
///
/// Ids are handed out in increasing order by the transaction manager, so a
/// larger id always belongs to a more recently started transaction.
pub type TxnId = u64;

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Read lock, may be held by many transactions at once
    Shared,
    /// Write lock, excludes every other holder
    Exclusive,
}

impl LockMode {
    /// Check whether a lock in this mode can coexist with one in `other`
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding this mode already satisfies a request for `requested`
    pub fn covers(self, requested: LockMode) -> bool {
        self == LockMode::Exclusive || requested == LockMode::Shared
    }
}
