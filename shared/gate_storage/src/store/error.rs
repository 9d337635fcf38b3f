//! Error types for record store operations

use thiserror::Error;

/// Result type for record store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing records
#[derive(Error, Debug)]
pub enum StoreError {
    /// The LMDB environment or a transaction failed
    #[error("LMDB error: {0}")]
    Backend(#[from] heed::Error),

    /// The storage directory could not be prepared
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
