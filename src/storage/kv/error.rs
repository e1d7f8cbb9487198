use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key store is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },
}

/// Result type for key store operations
pub type Result<T> = std::result::Result<T, StoreError>;
