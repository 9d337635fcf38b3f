//! Error types for session storage operations

use thiserror::Error;

use crate::store::StoreError;

/// Result type for session storage operations
pub type SessionStorageResult<T> = Result<T, SessionStorageError>;

/// Errors that can occur while transitioning a verification session
#[derive(Error, Debug)]
pub enum SessionStorageError {
    /// No session exists for the user
    #[error("No verification session for user {0}")]
    NotFound(i64),

    /// The session already reached a terminal state
    #[error("Verification session for user {0} is no longer pending")]
    NotPending(i64),

    /// The session was replaced by a newer attempt for the same user
    #[error("Verification session for user {0} was replaced by a newer attempt")]
    Replaced(i64),

    /// The underlying record store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}
