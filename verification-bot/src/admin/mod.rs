//! Administrator commands
//!
//! An administrator first runs `/check_admin` in the group, which links their private
//! chat to it. Every later command acts on the linked group and re-checks the caller's
//! role there.

use std::fmt::Write as _;
use std::sync::Arc;

use gate_storage::{
    AdminLink, AdminLinkStorage, FailureReason, GroupConfigError, GroupConfigStorage,
    GroupVerificationConfig, RestrictionPolicy, RosterStorage, SessionStorage,
    SessionStorageError, StoreError, VerificationParams, VerificationSession, VerifiedUser,
};
use tracing::info;

use crate::chat::{ChatClient, ChatGroup, ChatUser};
use crate::types::{AdminError, AdminResult};

/// Result of submitting a parameter set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsSubmitted {
    pub config: GroupVerificationConfig,
    /// The group still has to choose between `block` and `delete`
    pub needs_restriction_policy: bool,
}

/// Group configuration commands for administrators
pub struct AdminService {
    sessions: Arc<SessionStorage>,
    group_configs: Arc<GroupConfigStorage>,
    admin_links: Arc<AdminLinkStorage>,
    roster: Arc<RosterStorage>,
    chat: Arc<dyn ChatClient>,
}

impl AdminService {
    /// Creates a new `AdminService`
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStorage>,
        group_configs: Arc<GroupConfigStorage>,
        admin_links: Arc<AdminLinkStorage>,
        roster: Arc<RosterStorage>,
        chat: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            sessions,
            group_configs,
            admin_links,
            roster,
            chat,
        }
    }

    /// Links the caller to `group` after checking both the bot and the caller are administrators
    ///
    /// # Errors
    ///
    /// Returns `AdminError::BotNotAdministrator` or `AdminError::NotAdministrator` when a
    /// role is missing, or a chat or store error
    pub async fn check_admin(&self, group: &ChatGroup, user: &ChatUser) -> AdminResult<AdminLink> {
        let bot = self.chat.bot_identity().await?;
        if !self.chat.member_role(group.id, bot.user_id).await?.is_admin() {
            return Err(AdminError::BotNotAdministrator(group.id));
        }
        self.require_admin(group.id, user.id).await?;

        Ok(self
            .admin_links
            .link(user.id, group.id, group.title.clone())?)
    }

    async fn require_admin(&self, group_id: i64, user_id: i64) -> AdminResult<()> {
        if self.chat.member_role(group_id, user_id).await?.is_admin() {
            Ok(())
        } else {
            Err(AdminError::NotAdministrator { group_id, user_id })
        }
    }

    /// Resolves the caller's linked group and re-checks their role there
    async fn linked_group(&self, admin_id: i64) -> AdminResult<AdminLink> {
        let link = self
            .admin_links
            .get(admin_id)?
            .ok_or(AdminError::NotLinked(admin_id))?;
        self.require_admin(link.group_id, admin_id).await?;
        Ok(link)
    }

    /// Parses and appends a parameter set to the linked group
    ///
    /// # Errors
    ///
    /// Returns `AdminError::InvalidJson` when the text is not JSON, a configuration error
    /// when required fields are missing, or an authorization error
    pub async fn submit_params(&self, admin_id: i64, raw: &str) -> AdminResult<ParamsSubmitted> {
        let link = self.linked_group(admin_id).await?;

        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| AdminError::InvalidJson(e.to_string()))?;
        let params: VerificationParams = serde_json::from_value(value)
            .map_err(|e| GroupConfigError::InvalidParams(e.to_string()))?;

        let config = self.group_configs.append(link.group_id, params)?;
        Ok(ParamsSubmitted {
            needs_restriction_policy: config.restriction_policy.is_none(),
            config,
        })
    }

    /// Sets how the linked group treats unverified members, returning whether it changed
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Config` when the group has no parameters yet, or an
    /// authorization error
    pub async fn set_restriction_policy(
        &self,
        admin_id: i64,
        policy: RestrictionPolicy,
    ) -> AdminResult<bool> {
        let link = self.linked_group(admin_id).await?;
        Ok(self
            .group_configs
            .set_restriction_policy(link.group_id, policy)?)
    }

    /// Selects the parameter set used for new requests in the linked group
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Config` when `index` is out of range, or an authorization error
    pub async fn switch_active(
        &self,
        admin_id: i64,
        index: usize,
    ) -> AdminResult<GroupVerificationConfig> {
        let link = self.linked_group(admin_id).await?;
        Ok(self.group_configs.switch_active(link.group_id, index)?)
    }

    /// Renders the linked group's configuration as markdown
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Config` when nothing is configured, or an authorization error
    pub async fn describe_config(&self, admin_id: i64) -> AdminResult<String> {
        let link = self.linked_group(admin_id).await?;
        let config = self.group_configs.get(link.group_id)?;
        render_config(&config)
    }

    /// Removes every parameter set and the policy of the linked group
    ///
    /// # Errors
    ///
    /// Returns an authorization or store error
    pub async fn clear_params(&self, admin_id: i64) -> AdminResult<bool> {
        let link = self.linked_group(admin_id).await?;
        Ok(self.group_configs.clear(link.group_id)?)
    }

    /// Lists members of the linked group who passed verification
    ///
    /// # Errors
    ///
    /// Returns an authorization or store error
    pub async fn verified_users(&self, admin_id: i64) -> AdminResult<Vec<VerifiedUser>> {
        let link = self.linked_group(admin_id).await?;
        Ok(self.roster.list(link.group_id)?)
    }

    /// Empties the verified-user roster of the linked group
    ///
    /// # Errors
    ///
    /// Returns an authorization or store error
    pub async fn clear_roster(&self, admin_id: i64) -> AdminResult<usize> {
        let link = self.linked_group(admin_id).await?;
        let removed = self.roster.clear(link.group_id)?;
        info!(admin_id, group_id = link.group_id, removed, "Cleared verified users");
        Ok(removed)
    }

    /// Fails a member's pending session in the linked group
    ///
    /// The dispatcher removes the member once the failure is committed.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Session` when the user has no pending session in the linked
    /// group, or an authorization error
    pub async fn force_remove(
        &self,
        admin_id: i64,
        user_id: i64,
    ) -> AdminResult<VerificationSession> {
        let link = self.linked_group(admin_id).await?;

        let target = self
            .sessions
            .get(user_id)?
            .filter(|session| session.group_id == link.group_id)
            .ok_or(SessionStorageError::NotFound(user_id))?;

        let session = self.sessions.mark_failed(
            user_id,
            target.attempt_id,
            FailureReason::RemovedByAdmin,
        )?;
        info!(admin_id, user_id, group_id = link.group_id, "Administrator removed pending member");
        Ok(session)
    }
}

/// Markdown listing of every parameter set with the active one marked
fn render_config(config: &GroupVerificationConfig) -> AdminResult<String> {
    let mut response = String::from("*Verification parameters for the group:*\n\n");

    for (i, params) in config.verification_params.iter().enumerate() {
        let marker = if config.active_index == Some(i) {
            " (active)"
        } else {
            ""
        };
        let formatted = serde_json::to_string_pretty(params).map_err(StoreError::from)?;
        let _ = write!(
            response,
            "*Type:* `{}`{marker}\n\n```\n{formatted}\n```\n\n",
            params.verification_type().unwrap_or("unknown")
        );
    }

    let policy = config
        .restriction_policy
        .map_or_else(|| "Not set".to_string(), |policy| policy.to_string());
    let _ = write!(response, "*Restriction type for new members:* `{policy}`");

    Ok(response)
}
