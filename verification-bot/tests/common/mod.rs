// Not every helper is used in every test, so we allow dead code
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gate_storage::{RestrictionPolicy, Storage, VerificationParams};
use tempfile::TempDir;
use verification_bot::chat::mock::{ChatCall, RecordingChatClient};
use verification_bot::chat::{ChatGroup, ChatUser, MemberRole};
use verification_bot::types::BotConfig;
use verification_bot::zkp::verifier::mock::StaticVerifier;
use verification_bot::VerificationBot;

pub const GROUP_ID: i64 = -1_001_234;
pub const OTHER_GROUP_ID: i64 = -777;
pub const ADMIN_ID: i64 = 10;
pub const MEMBER_ID: i64 = 20;
pub const TIMEOUT: Duration = Duration::from_secs(600);
pub const DEEP_LINK_BASE: &str = "https://wallet.privado.id/#i_m=";

const TEST_MAP_SIZE: usize = 16 * 1024 * 1024;

/// Initialize tracing for tests
pub fn setup_test_env() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

/// A running bot wired to recording collaborators
pub struct TestBot {
    pub bot: VerificationBot,
    pub chat: Arc<RecordingChatClient>,
    pub verifier: Arc<StaticVerifier>,
    // Keep the store directory alive for the duration of the test
    pub dir: TempDir,
}

impl TestBot {
    /// Starts a bot over a fresh store with an accepting verifier
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        Self::start_in(dir, StaticVerifier::accepting())
    }

    /// Starts a bot over an existing store directory
    pub fn start_in(dir: TempDir, verifier: StaticVerifier) -> Self {
        Self::start_with(dir, RecordingChatClient::new(), verifier)
    }

    /// Starts a bot with the given collaborators; the bot and `ADMIN_ID` administer the group
    pub fn start_with(dir: TempDir, chat: RecordingChatClient, verifier: StaticVerifier) -> Self {
        setup_test_env();

        let chat = Arc::new(chat);
        chat.promote_bot(GROUP_ID);
        chat.set_role(GROUP_ID, ADMIN_ID, MemberRole::Administrator);
        let verifier = Arc::new(verifier);

        let bot = VerificationBot::start_with_config(
            test_config(dir.path()),
            chat.clone(),
            verifier.clone(),
        )
        .expect("failed to start bot");

        Self {
            bot,
            chat,
            verifier,
            dir,
        }
    }

    pub fn storage(&self) -> &Storage {
        self.bot.storage()
    }

    /// Adds one parameter set to the test group, with `policy` if given
    pub fn configure_group(&self, policy: Option<RestrictionPolicy>) {
        let configs = &self.storage().group_configs;
        configs
            .append(GROUP_ID, sample_params(1, "KYCAgeCredential"))
            .expect("append params");
        if let Some(policy) = policy {
            configs
                .set_restriction_policy(GROUP_ID, policy)
                .expect("set policy");
        }
    }

    /// Adds one parameter set and a policy to the second test group
    pub fn configure_other_group(&self, policy: RestrictionPolicy) {
        let configs = &self.storage().group_configs;
        configs
            .append(OTHER_GROUP_ID, sample_params(2, "KYCAgeCredential"))
            .expect("append params");
        configs
            .set_restriction_policy(OTHER_GROUP_ID, policy)
            .expect("set policy");
    }

    /// Waits until the chat client has seen `call`
    pub async fn wait_for_call(&self, call: &ChatCall) {
        for _ in 0..200 {
            if self.calls().contains(call) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("chat call {call:?} never happened");
    }

    /// Waits until the record for `user_id` is gone, which is the dispatcher's last step
    pub async fn wait_for_removal(&self, user_id: i64) {
        for _ in 0..200 {
            if self
                .storage()
                .sessions
                .get(user_id)
                .expect("read session")
                .is_none()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session for user {user_id} was never removed");
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.chat.calls()
    }

    pub fn removals(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ChatCall::RemoveThenReadmit { .. }))
            .count()
    }
}

pub fn test_config(path: &Path) -> BotConfig {
    BotConfig {
        database_path: path.to_path_buf(),
        database_map_size: TEST_MAP_SIZE,
        verification_timeout: TIMEOUT,
        wallet_deep_link_base: DEEP_LINK_BASE.to_string(),
    }
}

pub fn group() -> ChatGroup {
    ChatGroup {
        id: GROUP_ID,
        title: Some("Adults only".to_string()),
    }
}

pub fn other_group() -> ChatGroup {
    ChatGroup {
        id: OTHER_GROUP_ID,
        title: Some("Other group".to_string()),
    }
}

pub fn member() -> ChatUser {
    ChatUser {
        id: MEMBER_ID,
        username: Some("newcomer".to_string()),
    }
}

pub fn admin() -> ChatUser {
    ChatUser {
        id: ADMIN_ID,
        username: Some("moderator".to_string()),
    }
}

/// Opens the store at `path` directly, outside of any running bot
pub fn open_storage(path: &Path) -> Storage {
    Storage::open(path, TEST_MAP_SIZE).expect("failed to open storage")
}

pub fn sample_params(id: u32, credential_type: &str) -> VerificationParams {
    serde_json::from_value(serde_json::json!({
        "circuitId": "credentialAtomicQuerySigV2",
        "id": id,
        "query": {
            "allowedIssuers": ["*"],
            "type": credential_type,
            "credentialSubject": {"birthday": {"$lt": 20_000_101}}
        }
    }))
    .expect("valid params")
}
