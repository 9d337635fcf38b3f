pub mod error;
pub mod request;
pub mod verifier;

pub use error::ZkpError;
pub use request::{AuthorizationRequestTemplate, VerificationRequest};
pub use verifier::IdentityVerifier;
