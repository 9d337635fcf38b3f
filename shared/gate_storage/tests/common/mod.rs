#![allow(dead_code)]

use gate_storage::{Storage, VerificationParams};
use tempfile::TempDir;

const TEST_MAP_SIZE: usize = 16 * 1024 * 1024;

/// Storage opened in a throwaway directory that is removed on drop
pub struct TestContext {
    pub storage: Storage,
    _dir: TempDir,
}

/// Opens a fresh record store
pub fn setup_test() -> TestContext {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let storage = Storage::open(dir.path(), TEST_MAP_SIZE).expect("failed to open storage");
    TestContext { storage, _dir: dir }
}

/// Builds a complete parameter set with the given id and credential type
pub fn sample_params(id: u32, credential_type: &str) -> VerificationParams {
    serde_json::from_value(serde_json::json!({
        "circuitId": "credentialAtomicQuerySigV2",
        "id": id,
        "query": {
            "allowedIssuers": ["*"],
            "context": "https://raw.githubusercontent.com/iden3/claim-schema-vocab/main/schemas/json-ld/kyc-v3.json-ld",
            "type": credential_type,
            "credentialSubject": {"birthday": {"$lt": 20_000_101}}
        }
    }))
    .expect("valid params")
}
