use std::time::Duration;

/// Whether a cache participates in transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtomicityMode {
    /// Reads and writes go through the lock table and are buffered until commit
    #[default]
    Transactional,
    /// No locking; every operation applies to the store on its own
    Atomic,
}

/// Configuration for a transactional cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, only used to tag log output
    pub name: String,

    /// Atomicity mode of the cache
    pub atomicity_mode: AtomicityMode,

    /// Upper bound for a single blocked lock acquisition (None = wait until
    /// granted, chosen as deadlock victim or cancelled)
    pub lock_wait_timeout: Option<Duration>,

    /// How often a blocked acquisition re-checks the wait-for graph
    pub deadlock_check_interval: Duration,

    /// Maximum number of keys the store may hold (None = unbounded)
    pub store_capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            atomicity_mode: AtomicityMode::Transactional,
            lock_wait_timeout: None,
            deadlock_check_interval: Duration::from_millis(50),
            store_capacity: None,
        }
    }
}

impl CacheConfig {
    /// Create a transactional configuration with the given cache name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_atomicity_mode(mut self, mode: AtomicityMode) -> Self {
        self.atomicity_mode = mode;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }

    pub fn with_deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval = interval;
        self
    }

    pub fn with_store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = Some(capacity);
        self
    }

    /// Whether operations on this cache take locks at all
    pub fn is_transactional(&self) -> bool {
        self.atomicity_mode == AtomicityMode::Transactional
    }
}
