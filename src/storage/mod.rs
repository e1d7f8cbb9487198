pub mod kv;

pub use kv::{KeyStore, StoreError};
