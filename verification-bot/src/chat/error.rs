//! Error types for chat platform calls

use thiserror::Error;

/// Result type for chat platform calls
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors reported by the chat platform client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The platform refused the call, e.g. missing rights or a blocked bot
    #[error("Chat platform rejected the request: {0}")]
    Rejected(String),

    /// The chat, user or message does not exist
    #[error("Chat resource not found: {0}")]
    NotFound(String),

    /// The platform could not be reached
    #[error("Chat platform unavailable: {0}")]
    Unavailable(String),
}
