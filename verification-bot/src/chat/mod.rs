//! Chat platform client contract
//!
//! The bot only needs a handful of moderation and messaging calls. Private chats are
//! addressed by the user's id.

mod error;

use async_trait::async_trait;
use gate_storage::MessageRef;
use strum::Display;

pub use error::{ChatError, ChatResult};

/// Role of a user in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MemberRole {
    Member,
    Administrator,
    Creator,
}

impl MemberRole {
    /// Whether the role can configure the group
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Administrator | Self::Creator)
    }
}

/// Inline button opening a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkButton {
    pub text: String,
    pub url: String,
}

impl LinkButton {
    #[must_use]
    pub fn new(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: url.into(),
        }
    }
}

/// How message text is rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
}

/// Message to send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub format: TextFormat,
    pub buttons: Vec<LinkButton>,
}

impl OutgoingMessage {
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::Markdown,
            buttons: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_button(mut self, button: LinkButton) -> Self {
        self.buttons.push(button);
        self
    }
}

/// A user as seen in an incoming chat update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: i64,
    pub username: Option<String>,
}

impl ChatUser {
    /// Name used to mention the user in messages
    #[must_use]
    pub fn mention(&self) -> String {
        self.username
            .as_ref()
            .map_or_else(|| format!("user {}", self.id), |name| format!("@{name}"))
    }
}

/// A group as seen in an incoming chat update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatGroup {
    pub id: i64,
    pub title: Option<String>,
}

/// The bot's own account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: i64,
    pub username: String,
}

impl BotIdentity {
    /// Link opening a private chat with the bot
    #[must_use]
    pub fn start_url(&self) -> String {
        format!("https://t.me/{}", self.username)
    }
}

/// Chat platform operations used by the bot
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Grants (`allow = true`) or revokes the user's right to send messages in a group
    async fn restrict_send(&self, group_id: i64, user_id: i64, allow: bool) -> ChatResult<()>;

    /// Removes the user from the group and immediately lifts the ban so they may rejoin
    async fn remove_then_readmit(&self, group_id: i64, user_id: i64) -> ChatResult<()>;

    /// Sends a message to a group or to a user's private chat
    async fn send_message(&self, chat_id: i64, message: OutgoingMessage) -> ChatResult<MessageRef>;

    /// Sends a file to a group or to a user's private chat
    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        contents: Vec<u8>,
    ) -> ChatResult<MessageRef>;

    async fn delete_message(&self, message: MessageRef) -> ChatResult<()>;

    /// Looks up the user's current role in a group
    async fn member_role(&self, group_id: i64, user_id: i64) -> ChatResult<MemberRole>;

    async fn bot_identity(&self) -> ChatResult<BotIdentity>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gate_storage::MessageRef;

    use super::{BotIdentity, ChatClient, ChatError, ChatResult, MemberRole, OutgoingMessage};

    /// A call made against [`RecordingChatClient`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ChatCall {
        RestrictSend {
            group_id: i64,
            user_id: i64,
            allow: bool,
        },
        RemoveThenReadmit {
            group_id: i64,
            user_id: i64,
        },
        SendMessage {
            chat_id: i64,
            message: OutgoingMessage,
        },
        SendDocument {
            chat_id: i64,
            file_name: String,
            contents: Vec<u8>,
        },
        DeleteMessage(MessageRef),
    }

    /// Chat client that records every call and answers role lookups from a table
    pub struct RecordingChatClient {
        identity: BotIdentity,
        roles: Mutex<HashMap<(i64, i64), MemberRole>>,
        calls: Mutex<Vec<ChatCall>>,
        next_message_id: Mutex<i32>,
        fail_restrict: bool,
    }

    impl Default for RecordingChatClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RecordingChatClient {
        pub const BOT_USER_ID: i64 = 999;

        #[must_use]
        pub fn new() -> Self {
            Self {
                identity: BotIdentity {
                    user_id: Self::BOT_USER_ID,
                    username: "gate_test_bot".to_string(),
                },
                roles: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                next_message_id: Mutex::new(0),
                fail_restrict: false,
            }
        }

        /// Makes every `restrict_send` call fail
        #[must_use]
        pub fn failing_restrictions(mut self) -> Self {
            self.fail_restrict = true;
            self
        }

        /// Sets a user's role in a group; unknown users are plain members
        pub fn set_role(&self, group_id: i64, user_id: i64, role: MemberRole) {
            self.roles
                .lock()
                .unwrap()
                .insert((group_id, user_id), role);
        }

        /// Makes the bot an administrator of the group
        pub fn promote_bot(&self, group_id: i64) {
            self.set_role(group_id, Self::BOT_USER_ID, MemberRole::Administrator);
        }

        #[must_use]
        pub fn calls(&self) -> Vec<ChatCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Texts of every message sent to `chat_id`
        #[must_use]
        pub fn texts_sent_to(&self, chat_id: i64) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    ChatCall::SendMessage { chat_id: id, message } if id == chat_id => {
                        Some(message.text)
                    }
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: ChatCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn next_message(&self, chat_id: i64) -> MessageRef {
            let mut next = self.next_message_id.lock().unwrap();
            *next += 1;
            MessageRef {
                chat_id,
                message_id: *next,
            }
        }
    }

    #[async_trait]
    impl ChatClient for RecordingChatClient {
        async fn restrict_send(&self, group_id: i64, user_id: i64, allow: bool) -> ChatResult<()> {
            self.record(ChatCall::RestrictSend {
                group_id,
                user_id,
                allow,
            });
            if self.fail_restrict {
                return Err(ChatError::Rejected("not enough rights".to_string()));
            }
            Ok(())
        }

        async fn remove_then_readmit(&self, group_id: i64, user_id: i64) -> ChatResult<()> {
            self.record(ChatCall::RemoveThenReadmit { group_id, user_id });
            Ok(())
        }

        async fn send_message(
            &self,
            chat_id: i64,
            message: OutgoingMessage,
        ) -> ChatResult<MessageRef> {
            self.record(ChatCall::SendMessage { chat_id, message });
            Ok(self.next_message(chat_id))
        }

        async fn send_document(
            &self,
            chat_id: i64,
            file_name: &str,
            contents: Vec<u8>,
        ) -> ChatResult<MessageRef> {
            self.record(ChatCall::SendDocument {
                chat_id,
                file_name: file_name.to_string(),
                contents,
            });
            Ok(self.next_message(chat_id))
        }

        async fn delete_message(&self, message: MessageRef) -> ChatResult<()> {
            self.record(ChatCall::DeleteMessage(message));
            Ok(())
        }

        async fn member_role(&self, group_id: i64, user_id: i64) -> ChatResult<MemberRole> {
            Ok(self
                .roles
                .lock()
                .unwrap()
                .get(&(group_id, user_id))
                .copied()
                .unwrap_or(MemberRole::Member))
        }

        async fn bot_identity(&self) -> ChatResult<BotIdentity> {
            Ok(self.identity.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_roles() {
        assert!(MemberRole::Creator.is_admin());
        assert!(MemberRole::Administrator.is_admin());
        assert!(!MemberRole::Member.is_admin());
    }

    #[test]
    fn test_mention_falls_back_to_id() {
        let named = ChatUser {
            id: 1,
            username: Some("alice".to_string()),
        };
        let anonymous = ChatUser {
            id: 2,
            username: None,
        };
        assert_eq!(named.mention(), "@alice");
        assert_eq!(anonymous.mention(), "user 2");
    }

    #[test]
    fn test_bot_start_url() {
        let bot = BotIdentity {
            user_id: 1,
            username: "gate_bot".to_string(),
        };
        assert_eq!(bot.start_url(), "https://t.me/gate_bot");
    }
}
