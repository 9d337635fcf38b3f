use async_trait::async_trait;
use gate_storage::VerificationParams;

use super::{VerificationRequest, ZkpError};

/// Credential proof library used to issue requests and check returned proofs
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Builds the request the user's wallet has to answer
    ///
    /// # Arguments
    ///
    /// * `session_id` - Identifies the session the proof will be delivered for
    /// * `params` - The group's active parameter set
    async fn build_request(
        &self,
        session_id: i64,
        params: &VerificationParams,
    ) -> Result<VerificationRequest, ZkpError>;

    /// Checks a proof token against the request it answers
    ///
    /// # Errors
    ///
    /// Rejections are reported as errors for which [`ZkpError::is_rejection`] holds
    async fn verify(&self, proof_token: &str, request: &VerificationRequest) -> Result<(), ZkpError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gate_storage::VerificationParams;
    use tokio::sync::Notify;

    use super::IdentityVerifier;
    use crate::zkp::{AuthorizationRequestTemplate, VerificationRequest, ZkpError};

    /// Verifier returning a fixed verdict and recording the requests it was asked to check
    pub struct StaticVerifier {
        template: AuthorizationRequestTemplate,
        verdict: Mutex<Result<(), ZkpError>>,
        checked: Mutex<Vec<(String, VerificationRequest)>>,
        release: Option<Notify>,
    }

    impl StaticVerifier {
        #[must_use]
        pub fn new(verdict: Result<(), ZkpError>) -> Self {
            Self {
                template: AuthorizationRequestTemplate {
                    callback_url: "https://gate.test/api/callback".to_string(),
                    audience: "did:test:verifier".to_string(),
                    reason: "group verification".to_string(),
                },
                verdict: Mutex::new(verdict),
                checked: Mutex::new(Vec::new()),
                release: None,
            }
        }

        /// Accepting verifier whose `verify` waits until [`Self::release`] is called
        #[must_use]
        pub fn held() -> Self {
            Self {
                release: Some(Notify::new()),
                ..Self::accepting()
            }
        }

        /// Lets one held `verify` call return
        pub fn release(&self) {
            if let Some(release) = &self.release {
                release.notify_one();
            }
        }

        #[must_use]
        pub fn accepting() -> Self {
            Self::new(Ok(()))
        }

        #[must_use]
        pub fn rejecting() -> Self {
            Self::new(Err(ZkpError::InvalidProof("query not satisfied".to_string())))
        }

        pub fn set_verdict(&self, verdict: Result<(), ZkpError>) {
            *self.verdict.lock().unwrap() = verdict;
        }

        /// Proof tokens and requests passed to `verify`, in call order
        #[must_use]
        pub fn checked(&self) -> Vec<(String, VerificationRequest)> {
            self.checked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn build_request(
            &self,
            session_id: i64,
            params: &VerificationParams,
        ) -> Result<VerificationRequest, ZkpError> {
            Ok(self.template.build(session_id, params))
        }

        async fn verify(
            &self,
            proof_token: &str,
            request: &VerificationRequest,
        ) -> Result<(), ZkpError> {
            self.checked
                .lock()
                .unwrap()
                .push((proof_token.to_string(), request.clone()));
            if let Some(release) = &self.release {
                release.notified().await;
            }
            self.verdict.lock().unwrap().clone()
        }
    }
}
