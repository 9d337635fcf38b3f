use base64::{engine::general_purpose::STANDARD, Engine as _};
use gate_storage::VerificationParams;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::ZkpError;

/// Message type of an authorization request
const AUTHORIZATION_REQUEST_TYPE: &str = "https://iden3-communication.io/authorization/1.0/request";

/// Media type of an unencrypted protocol message
const PLAIN_MESSAGE_MEDIA_TYPE: &str = "application/iden3comm-plain-json";

/// Opaque request descriptor handed to the user's wallet
///
/// The bot stores it with the session and passes it back unchanged when the proof arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationRequest(pub serde_json::Value);

impl VerificationRequest {
    /// Builds the wallet link carrying this request as base64 encoded JSON
    ///
    /// # Errors
    ///
    /// Returns `ZkpError::InvalidRequest` if the request cannot be serialized
    pub fn deep_link(&self, base: &str) -> Result<String, ZkpError> {
        let bytes =
            serde_json::to_vec(&self.0).map_err(|e| ZkpError::InvalidRequest(e.to_string()))?;
        Ok(format!("{base}{}", STANDARD.encode(bytes)))
    }
}

/// Fixed parts of every authorization request a verifier issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequestTemplate {
    /// Endpoint the wallet posts the proof to; the session id is appended as a query parameter
    pub callback_url: String,
    /// Identifier of the verifying party
    pub audience: String,
    /// Reason shown to the user by the wallet
    pub reason: String,
}

impl AuthorizationRequestTemplate {
    /// Builds an authorization request with a single proof scope from `params`
    #[must_use]
    pub fn build(&self, session_id: i64, params: &VerificationParams) -> VerificationRequest {
        let thread_id = Uuid::new_v4().to_string();

        VerificationRequest(json!({
            "id": thread_id,
            "thid": thread_id,
            "typ": PLAIN_MESSAGE_MEDIA_TYPE,
            "type": AUTHORIZATION_REQUEST_TYPE,
            "from": self.audience,
            "body": {
                "callbackUrl": format!("{}?sessionId={session_id}", self.callback_url),
                "reason": self.reason,
                "scope": [{
                    "id": params.id,
                    "circuitId": params.circuit_id,
                    "query": params.query,
                }],
            },
        }))
    }
}
