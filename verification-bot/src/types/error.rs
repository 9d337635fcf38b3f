//! Service level errors and the replies shown to chat users

use gate_storage::{GroupConfigError, SessionStorageError, StoreError};
use thiserror::Error;

use crate::chat::ChatError;
use crate::zkp::ZkpError;

/// Result type for verification lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Result type for administrator operations
pub type AdminResult<T> = Result<T, AdminError>;

/// Errors raised while driving a verification session
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The user has no pending session
    #[error("User {0} is not awaiting verification")]
    NotAwaitingVerification(i64),

    /// A proof arrived for an unknown session
    #[error("Verification session {0} not found")]
    SessionNotFound(i64),

    /// A proof arrived for a session that already resolved
    #[error("Verification session {0} already resolved")]
    AlreadyResolved(i64),

    /// The group has no verification parameters
    #[error("Group {0} is not configured for verification")]
    NotConfigured(i64),

    /// The group's stored configuration is inconsistent
    #[error("Group {group_id} has an invalid verification configuration: {detail}")]
    InvalidConfiguration { group_id: i64, detail: String },

    /// No group to run the operation against
    #[error("No group selected for user {0}")]
    NoGroupSelected(i64),

    /// The caller is not an administrator of the group
    #[error("User {user_id} is not an administrator of group {group_id}")]
    NotAdministrator { group_id: i64, user_id: i64 },

    /// The credential verifier failed without a verdict
    #[error("Verifier error: {0}")]
    Verifier(#[from] ZkpError),

    /// The chat platform call failed
    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    /// The record store failed
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<SessionStorageError> for LifecycleError {
    fn from(err: SessionStorageError) -> Self {
        match err {
            SessionStorageError::NotFound(user_id) => Self::SessionNotFound(user_id),
            SessionStorageError::NotPending(user_id) | SessionStorageError::Replaced(user_id) => {
                Self::AlreadyResolved(user_id)
            }
            SessionStorageError::Store(e) => Self::Storage(e),
        }
    }
}

impl From<GroupConfigError> for LifecycleError {
    fn from(err: GroupConfigError) -> Self {
        match err {
            GroupConfigError::NotConfigured(group_id) => Self::NotConfigured(group_id),
            GroupConfigError::InvalidActiveIndex {
                group_id,
                index,
                len,
            } => Self::InvalidConfiguration {
                group_id,
                detail: format!("active index {index:?} out of range for {len} parameter sets"),
            },
            GroupConfigError::InvalidParams(detail) => Self::InvalidConfiguration {
                group_id: 0,
                detail,
            },
            GroupConfigError::Store(e) => Self::Storage(e),
        }
    }
}

impl LifecycleError {
    /// Text to show the chat user, logging the error at a level matching its class
    #[must_use]
    #[allow(clippy::cognitive_complexity)]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotAwaitingVerification(_) | Self::AlreadyResolved(_) => {
                tracing::debug!("{self}");
                "You are not awaiting verification in any group."
            }
            Self::SessionNotFound(_) => {
                tracing::warn!("{self}");
                "Verification session not found."
            }
            Self::NotConfigured(_) => {
                tracing::warn!("{self}");
                "Verification parameters are not configured for your group."
            }
            Self::InvalidConfiguration { .. } => {
                tracing::error!("{self}");
                "Verification configuration error. Please contact the group administrator."
            }
            Self::NoGroupSelected(_) => {
                tracing::warn!("{self}");
                "You need to specify a group for verification setup."
            }
            Self::NotAdministrator { .. } => {
                tracing::warn!("{self}");
                "You are not an administrator in this group."
            }
            Self::Verifier(ZkpError::InvalidRequest(_)) => {
                tracing::error!("{self}");
                "Failed to generate verification request. Please try again later."
            }
            Self::Verifier(_) => {
                tracing::error!("{self}");
                "Verification service is temporarily unavailable. Please try again later."
            }
            Self::Chat(_) => {
                tracing::error!("{self}");
                "Failed to send verification link. Please check your private messages."
            }
            Self::Storage(_) => {
                tracing::error!("{self}");
                "Internal error. Please try again later."
            }
        }
    }
}

/// Errors raised by administrator commands
#[derive(Error, Debug)]
pub enum AdminError {
    /// The administrator has not linked a group yet
    #[error("User {0} is not linked to a group")]
    NotLinked(i64),

    /// The caller is not an administrator of the group
    #[error("User {user_id} is not an administrator of group {group_id}")]
    NotAdministrator { group_id: i64, user_id: i64 },

    /// The bot lacks administrator rights in the group
    #[error("Bot is not an administrator of group {0}")]
    BotNotAdministrator(i64),

    /// Submitted parameters are not valid JSON of the expected shape
    #[error("Invalid parameter JSON: {0}")]
    InvalidJson(String),

    /// Group configuration could not be read or changed
    #[error(transparent)]
    Config(#[from] GroupConfigError),

    /// The targeted session could not be transitioned
    #[error(transparent)]
    Session(#[from] SessionStorageError),

    /// The chat platform call failed
    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    /// The record store failed
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl AdminError {
    /// Text to show the administrator, logging the error at a level matching its class
    #[must_use]
    #[allow(clippy::cognitive_complexity)]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotLinked(_) => {
                tracing::debug!("{self}");
                "You are not associated with any group. Use /check_admin in the group first."
            }
            Self::NotAdministrator { .. } => {
                tracing::warn!("{self}");
                "You are not an administrator in this group."
            }
            Self::BotNotAdministrator(_) => {
                tracing::warn!("{self}");
                "I am not an administrator in this group. Please promote me to an administrator."
            }
            Self::InvalidJson(_) => {
                tracing::debug!("{self}");
                "Invalid JSON format. Please ensure your parameters match the expected structure."
            }
            Self::Config(GroupConfigError::InvalidParams(_)) => {
                tracing::debug!("{self}");
                "Missing required fields in JSON. Please include 'circuitId', 'id', and 'query'."
            }
            Self::Config(GroupConfigError::NotConfigured(_)) => {
                tracing::debug!("{self}");
                "No verification parameters have been set for this group."
            }
            Self::Config(GroupConfigError::InvalidActiveIndex { .. }) => {
                tracing::warn!("{self}");
                "That verification type does not exist for this group."
            }
            Self::Session(
                SessionStorageError::NotFound(_)
                | SessionStorageError::NotPending(_)
                | SessionStorageError::Replaced(_),
            ) => {
                tracing::debug!("{self}");
                "That user is not awaiting verification."
            }
            Self::Chat(_) => {
                tracing::error!("{self}");
                "Failed to reach the chat platform. Please try again."
            }
            Self::Config(GroupConfigError::Store(_))
            | Self::Session(SessionStorageError::Store(_))
            | Self::Storage(_) => {
                tracing::error!("{self}");
                "Internal error. Please try again later."
            }
        }
    }
}
