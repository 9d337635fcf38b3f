use thiserror::Error;

/// Error types for credential proof requests and verification
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZkpError {
    /// The proof does not satisfy the request
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// The proof token could not be parsed
    #[error("Invalid proof data: {0}")]
    InvalidProofData(String),

    /// The issuer state referenced by the proof is older than the accepted transition delay
    #[error("State transition too old")]
    StateTooOld,

    /// A verification request could not be built from the parameter set
    #[error("Invalid verification request: {0}")]
    InvalidRequest(String),

    /// No trusted state resolver could be reached
    #[error("State resolver unavailable: {0}")]
    ResolverUnavailable(String),
}

impl ZkpError {
    /// Whether the error is a verdict against the proof rather than an infrastructure failure
    ///
    /// Rejections end the session as failed. Other errors leave it pending so the user can
    /// submit again.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidProof(_) | Self::InvalidProofData(_) | Self::StateTooOld
        )
    }
}
