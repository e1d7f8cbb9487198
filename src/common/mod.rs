pub mod config;
pub mod types;

pub use config::{AtomicityMode, CacheConfig};
pub use types::{LockMode, TxnId};
