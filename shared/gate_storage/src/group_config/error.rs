//! Error types for group configuration storage

use thiserror::Error;

use crate::store::StoreError;

/// Result type for group configuration operations
pub type GroupConfigResult<T> = Result<T, GroupConfigError>;

/// Errors that can occur while reading or changing a group's verification configuration
#[derive(Error, Debug)]
pub enum GroupConfigError {
    /// The group has no verification parameter sets
    #[error("Group {0} has no verification configuration")]
    NotConfigured(i64),

    /// The stored active index does not point at a parameter set
    #[error("Active index {index:?} is out of range for group {group_id} with {len} parameter sets")]
    InvalidActiveIndex {
        group_id: i64,
        index: Option<usize>,
        len: usize,
    },

    /// A submitted parameter set is incomplete
    #[error("Invalid verification parameters: {0}")]
    InvalidParams(String),

    /// The underlying record store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}
