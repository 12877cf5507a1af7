// cvm-store/src/lib.rs

//! Persistence layer for the Cascoin Validator Module
//!
//! A typed key-value facade over a single sorted byte-key space (RocksDB
//! default column family):
//! - one-byte / short-word key prefixes per record family
//! - prefix scans for listing
//! - atomic write batches; deletes are tombstones applied on commit

pub mod db;
pub mod keys;

pub use db::{AtomicBatch, KvStore, StoreConfig};
pub use keys::KeyPrefix;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
