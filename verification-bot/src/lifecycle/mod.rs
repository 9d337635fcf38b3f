//! User-facing side of a verification session
//!
//! Joins open a session, `/verify` hands out the wallet link, the proof callback settles
//! the session. Everything that happens after a session resolves is left to the
//! [`ModerationDispatcher`](crate::dispatcher::ModerationDispatcher).

use std::sync::Arc;

use gate_storage::{
    AdminLinkStorage, FailureReason, GroupConfigError, GroupConfigStorage, MessageRef,
    RestrictionPolicy, SessionRole, SessionState, SessionStorage, VerificationParams,
    VerificationSession,
};
use tracing::{debug, error, info, instrument, warn};

use crate::chat::{ChatClient, ChatGroup, ChatUser, LinkButton, OutgoingMessage};
use crate::supervisor::TimeoutSupervisor;
use crate::types::{BotConfig, LifecycleError, LifecycleResult};
use crate::zkp::{IdentityVerifier, VerificationRequest};

const VERIFY_BUTTON_TEXT: &str = "Verify with Privado ID";
const MEMBER_REQUEST_TEXT: &str = "Please click the button below to verify your age:";
const SELF_TEST_REQUEST_TEXT: &str = "Please test verify your age by clicking the link below:";
const PROMPT_BUTTON_TEXT: &str = "Verify your age";

/// What happened when a user joined a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Administrators are never gated
    SkippedAdministrator,
    /// The group has no verification parameters, so the joiner is let in
    SkippedUnconfigured,
    /// A pending session was opened for the joiner
    Gated(VerificationSession),
}

/// Drives verification sessions from chat updates and proof callbacks
pub struct LifecycleService {
    config: BotConfig,
    sessions: Arc<SessionStorage>,
    group_configs: Arc<GroupConfigStorage>,
    admin_links: Arc<AdminLinkStorage>,
    chat: Arc<dyn ChatClient>,
    verifier: Arc<dyn IdentityVerifier>,
    supervisor: TimeoutSupervisor,
}

impl LifecycleService {
    /// Creates a new `LifecycleService`
    #[must_use]
    pub fn new(
        config: BotConfig,
        sessions: Arc<SessionStorage>,
        group_configs: Arc<GroupConfigStorage>,
        admin_links: Arc<AdminLinkStorage>,
        chat: Arc<dyn ChatClient>,
        verifier: Arc<dyn IdentityVerifier>,
        supervisor: TimeoutSupervisor,
    ) -> Self {
        Self {
            config,
            sessions,
            group_configs,
            admin_links,
            chat,
            verifier,
            supervisor,
        }
    }

    /// Opens a session for a user who just joined a group
    ///
    /// Under the `block` policy the joiner loses the right to send messages until the
    /// session resolves. A prompt linking to the bot is posted in the group.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError` if the role lookup or a store operation fails
    #[instrument(skip(self, group, user), fields(group_id = group.id, user_id = user.id))]
    pub async fn member_joined(
        &self,
        group: &ChatGroup,
        user: &ChatUser,
    ) -> LifecycleResult<JoinOutcome> {
        if self.chat.member_role(group.id, user.id).await?.is_admin() {
            debug!("Administrator joined, skipping verification");
            return Ok(JoinOutcome::SkippedAdministrator);
        }

        let policy = match self.group_configs.get(group.id) {
            Ok(config) => config.restriction_policy,
            Err(GroupConfigError::NotConfigured(_)) => {
                debug!("Group has no verification parameters, not gating joiner");
                return Ok(JoinOutcome::SkippedUnconfigured);
            }
            Err(e) => return Err(e.into()),
        };

        let mut session = self.sessions.create(
            VerificationSession::pending(user.id, group.id, SessionRole::Member)
                .with_username(user.username.clone())
                .with_group_title(group.title.clone()),
        )?;
        self.supervisor.watch(&session);

        if policy == Some(RestrictionPolicy::Block) {
            match self.chat.restrict_send(group.id, user.id, false).await {
                Ok(()) => {
                    session = self.sessions.mark_restricted(user.id, session.attempt_id)?;
                }
                Err(e) => warn!(error = ?e, "Failed to restrict new member"),
            }
        }

        match self.send_prompt(group.id, user).await {
            Ok(prompt) => {
                session = self
                    .sessions
                    .bind_prompt_message(user.id, session.attempt_id, prompt)?;
            }
            Err(e) => warn!(error = ?e, "Failed to post verification prompt"),
        }

        info!(policy = ?policy, "New member gated");
        Ok(JoinOutcome::Gated(session))
    }

    async fn send_prompt(&self, group_id: i64, user: &ChatUser) -> LifecycleResult<MessageRef> {
        let bot = self.chat.bot_identity().await?;
        let message = OutgoingMessage::plain(format!(
            "Hi, {}! Please verify your age by clicking the button below and call /verify command.",
            user.mention()
        ))
        .with_button(LinkButton::new(PROMPT_BUTTON_TEXT, bot.start_url()));

        Ok(self.chat.send_message(group_id, message).await?)
    }

    /// Issues a verification request for the user's pending session and sends the link
    ///
    /// Returns the wallet deep link.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NotAwaitingVerification` if the user has no pending session,
    /// a configuration error if the group cannot issue requests, or a collaborator error
    #[instrument(skip(self, user), fields(user_id = user.id))]
    pub async fn request_verification(&self, user: &ChatUser) -> LifecycleResult<String> {
        let session = self
            .sessions
            .get(user.id)?
            .filter(|session| session.pending)
            .ok_or(LifecycleError::NotAwaitingVerification(user.id))?;

        let params = self.active_params(session.group_id).await?;
        self.issue_request(&session, &params, MEMBER_REQUEST_TEXT)
            .await
    }

    /// Active parameter set of a group, alerting its administrators when the set is missing
    async fn active_params(&self, group_id: i64) -> LifecycleResult<VerificationParams> {
        match self.group_configs.active_params(group_id) {
            Ok(params) => Ok(params),
            Err(GroupConfigError::InvalidActiveIndex {
                group_id,
                index,
                len,
            }) => {
                error!(group_id, ?index, len, "Active verification parameters out of range");
                self.alert_administrators(group_id, index, len).await;
                Err(GroupConfigError::InvalidActiveIndex {
                    group_id,
                    index,
                    len,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn alert_administrators(&self, group_id: i64, index: Option<usize>, len: usize) {
        let admins = match self.admin_links.admins_for(group_id) {
            Ok(admins) => admins,
            Err(e) => {
                error!(group_id, error = ?e, "Failed to look up administrators to alert");
                return;
            }
        };
        if admins.is_empty() {
            warn!(group_id, "No linked administrator to alert about invalid configuration");
            return;
        }

        let selected = index.map_or_else(|| "none".to_string(), |index| index.to_string());
        let text = format!(
            "Members of group {group_id} cannot verify: the active verification type ({selected}) \
             does not match any of the {len} configured parameter sets. Please select a valid \
             verification type."
        );
        for admin_id in admins {
            if let Err(e) = self
                .chat
                .send_message(admin_id, OutgoingMessage::plain(text.clone()))
                .await
            {
                warn!(admin_id, group_id, error = ?e, "Failed to alert administrator");
            }
        }
    }

    async fn issue_request(
        &self,
        session: &VerificationSession,
        params: &VerificationParams,
        text: &str,
    ) -> LifecycleResult<String> {
        let request = self
            .verifier
            .build_request(session.session_id(), params)
            .await?;
        let link = request.deep_link(&self.config.wallet_deep_link_base)?;

        self.sessions.attach_request(
            session.user_id,
            session.attempt_id,
            request.0,
            params.verification_type().map(str::to_string),
        )?;

        self.chat
            .send_message(
                session.user_id,
                OutgoingMessage::plain(text).with_button(LinkButton::new(VERIFY_BUTTON_TEXT, &link)),
            )
            .await?;

        info!(
            user_id = session.user_id,
            group_id = session.group_id,
            role = %session.role,
            "Verification request issued"
        );
        Ok(link)
    }

    /// Settles a session with the proof token the wallet delivered
    ///
    /// A rejected proof fails the session. A verifier that cannot reach a verdict leaves
    /// the session pending so the timer or a retry decides.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::SessionNotFound` or `AlreadyResolved` when there is no
    /// pending session, `LifecycleError::Verifier` when no verdict was reached, or a store
    /// error
    #[instrument(skip(self, proof_token))]
    pub async fn complete_verification(
        &self,
        session_id: i64,
        proof_token: &str,
    ) -> LifecycleResult<SessionState> {
        let session = self
            .sessions
            .get(session_id)?
            .ok_or(LifecycleError::SessionNotFound(session_id))?;
        if !session.pending {
            return Err(LifecycleError::AlreadyResolved(session_id));
        }

        let request = match session.issued_request.clone() {
            Some(request) => VerificationRequest(request),
            None => {
                debug!("No stored request, rebuilding from active parameters");
                let params = self.active_params(session.group_id).await?;
                self.verifier
                    .build_request(session.session_id(), &params)
                    .await?
            }
        };

        // Settles only the attempt the proof was checked against
        match self.verifier.verify(proof_token, &request).await {
            Ok(()) => {
                self.sessions.mark_verified(
                    session_id,
                    session.attempt_id,
                    proof_token.to_string(),
                )?;
                Ok(SessionState::Verified)
            }
            Err(e) if e.is_rejection() => {
                info!(error = %e, "Proof rejected");
                self.sessions
                    .mark_failed(session_id, session.attempt_id, FailureReason::Rejected)?;
                Ok(SessionState::Failed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Starts an administrator's test run of the group's verification
    ///
    /// Runs against `current_group` when the command was issued in a group, otherwise
    /// against the group the administrator linked with `/check_admin`.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NoGroupSelected` when no group is known,
    /// `LifecycleError::NotAdministrator` when the caller lacks the role, a configuration
    /// error, or a collaborator error
    #[instrument(skip(self, user, current_group), fields(user_id = user.id))]
    pub async fn start_self_test(
        &self,
        user: &ChatUser,
        current_group: Option<&ChatGroup>,
    ) -> LifecycleResult<String> {
        let (group_id, group_title) = match current_group {
            Some(group) => (group.id, group.title.clone()),
            None => {
                let link = self
                    .admin_links
                    .get(user.id)?
                    .ok_or(LifecycleError::NoGroupSelected(user.id))?;
                (link.group_id, link.group_title)
            }
        };

        if !self.chat.member_role(group_id, user.id).await?.is_admin() {
            return Err(LifecycleError::NotAdministrator {
                group_id,
                user_id: user.id,
            });
        }

        let params = self.group_configs.active_params(group_id)?;
        let session = self.sessions.create(
            VerificationSession::pending(user.id, group_id, SessionRole::Administrator)
                .with_username(user.username.clone())
                .with_group_title(group_title),
        )?;
        self.supervisor.watch(&session);

        self.issue_request(&session, &params, SELF_TEST_REQUEST_TEXT)
            .await
    }

    /// Applies the `delete` policy to a message posted in a group
    ///
    /// Returns whether the message was deleted.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError` if a store read or the delete call fails
    pub async fn handle_group_message(
        &self,
        group: &ChatGroup,
        user: &ChatUser,
        message: MessageRef,
    ) -> LifecycleResult<bool> {
        let awaiting = self
            .sessions
            .get(user.id)?
            .is_some_and(|session| session.pending && session.group_id == group.id);
        if !awaiting {
            return Ok(false);
        }

        let policy = match self.group_configs.get(group.id) {
            Ok(config) => config.restriction_policy,
            Err(GroupConfigError::NotConfigured(_)) => None,
            Err(e) => return Err(e.into()),
        };
        if policy != Some(RestrictionPolicy::Delete) {
            return Ok(false);
        }

        self.chat.delete_message(message).await?;
        debug!(group_id = group.id, user_id = user.id, "Deleted message from unverified member");
        Ok(true)
    }

    /// Whether the user currently has a pending session
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Storage` if the store read fails
    pub fn is_awaiting_verification(&self, user_id: i64) -> LifecycleResult<bool> {
        Ok(self
            .sessions
            .get(user_id)?
            .is_some_and(|session| session.pending))
    }
}
