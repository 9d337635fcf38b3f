//! Moderation dispatcher
//!
//! Consumes session changes in commit order and turns terminal ones into chat actions:
//! verified members get their send right back and join the roster, failed members are
//! removed and readmitted, administrators running a self-test get a diagnostic report.
//! The session record is deleted once the final action has been taken, so records still
//! resolved at startup are outcomes a previous run never acted on and get replayed.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use gate_storage::{
    ChangeEvent, FailureReason, GroupConfigStorage, RosterStorage, SessionStorage, Subscription,
    VerificationSession,
};
use metrics::counter;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chat::{ChatClient, OutgoingMessage};

const PASSED_TEXT: &str = "You have successfully passed verification and can stay in the group.";
const FAILED_TEXT: &str = "You failed verification and were removed from the group.";
const TIMED_OUT_TEXT: &str =
    "You did not complete the verification on time and were removed from the group.";
const REMOVED_TEXT: &str = "An administrator removed you from the group before verification completed.";
const SUPERSEDED_TEXT: &str =
    "You started verifying for another group before finishing this one and were removed from the group.";
const SELF_TEST_PASSED_TEXT: &str =
    "The test was successful. The parameters are configured correctly, the verification process is working.";
const SELF_TEST_FAILED_TEXT: &str =
    "The test verification did not pass. Check the configured parameters and try again.";
const SELF_TEST_TIMED_OUT_TEXT: &str =
    "The test verification was not completed in time. No action was taken against your account.";
const SELF_TEST_SUPERSEDED_TEXT: &str =
    "The test verification was replaced by a newer one. No action was taken against your account.";

/// What the dispatcher did for one change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The change needed no moderation action
    Ignored,
    /// A verified member was let in and added to the roster
    MemberAdmitted,
    /// A failed member was removed from the group
    MemberRemoved,
    /// An administrator's successful self-test was reported
    SelfTestReported,
    /// An administrator's failed self-test was reported
    SelfTestFailed,
    /// A superseded session was cleaned up while a newer one gates the same group
    SessionRetired,
}

/// Turns committed session changes into chat platform actions
pub struct ModerationDispatcher {
    chat: Arc<dyn ChatClient>,
    sessions: Arc<SessionStorage>,
    group_configs: Arc<GroupConfigStorage>,
    roster: Arc<RosterStorage>,
}

impl ModerationDispatcher {
    /// Creates a new `ModerationDispatcher`
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        sessions: Arc<SessionStorage>,
        group_configs: Arc<GroupConfigStorage>,
        roster: Arc<RosterStorage>,
    ) -> Self {
        Self {
            chat,
            sessions,
            group_configs,
            roster,
        }
    }

    /// Processes events one at a time until shutdown or until the bus closes
    ///
    /// Resolved records left by a previous run are handled first. `subscription` must be
    /// taken before this runs so no change committed in between is lost.
    pub async fn run(self, subscription: Subscription, shutdown: CancellationToken) {
        info!("Moderation dispatcher started");

        let mut replayed = self.replay_resolved().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Moderation dispatcher received shutdown signal");
                    break;
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        info!("Session change bus closed");
                        break;
                    };
                    if event.is_terminal()
                        && event
                            .session
                            .as_ref()
                            .is_some_and(|session| replayed.remove(&session.attempt_id))
                    {
                        debug!(user_id = event.user_id, "Outcome already replayed at startup");
                        continue;
                    }
                    if let Err(e) = self.handle_event(&event).await {
                        error!(user_id = event.user_id, sequence = event.sequence, error = ?e, "Failed to dispatch session change");
                    }
                }
            }
        }

        info!("Moderation dispatcher stopped");
    }

    /// Takes the moderation action for every resolved record a previous run left behind
    ///
    /// Returns the attempts handled, whose change events must not be acted on again.
    pub async fn replay_resolved(&self) -> HashSet<Uuid> {
        let resolved = match self.sessions.resolved_sessions() {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(error = ?e, "Failed to list resolved sessions");
                return HashSet::new();
            }
        };
        if resolved.is_empty() {
            return HashSet::new();
        }

        info!(count = resolved.len(), "Replaying resolved sessions from a previous run");
        let mut replayed = HashSet::with_capacity(resolved.len());
        for session in resolved {
            if let Err(e) = self.handle_session(&session).await {
                error!(user_id = session.user_id, error = ?e, "Failed to replay resolved session");
            }
            counter!("session_replayed").increment(1);
            replayed.insert(session.attempt_id);
        }
        replayed
    }

    /// Takes the moderation action for one change event
    ///
    /// # Errors
    ///
    /// Returns an error if the roster or session record cannot be updated
    #[instrument(skip(self, event), fields(user_id = event.user_id, sequence = event.sequence))]
    pub async fn handle_event(&self, event: &ChangeEvent) -> anyhow::Result<DispatchOutcome> {
        let Some(session) = event.session.as_ref() else {
            debug!("Session record removed");
            return Ok(DispatchOutcome::Ignored);
        };

        self.handle_session(session).await
    }

    async fn handle_session(&self, session: &VerificationSession) -> anyhow::Result<DispatchOutcome> {
        if session.pending {
            return Ok(DispatchOutcome::Ignored);
        }

        if session.failure == Some(FailureReason::Superseded) && self.regated(session)? {
            return self.retire_superseded(session).await;
        }

        match (session.verified, session.is_administrator()) {
            (true, false) => self.admit_member(session).await,
            (true, true) => self.report_self_test(session).await,
            (false, false) => self.remove_member(session).await,
            (false, true) => self.report_failed_self_test(session).await,
        }
    }

    /// Whether a newer pending session gates the user in the same group
    fn regated(&self, session: &VerificationSession) -> anyhow::Result<bool> {
        Ok(self
            .sessions
            .get(session.user_id)
            .context("Failed to read current session")?
            .is_some_and(|current| {
                current.pending
                    && current.group_id == session.group_id
                    && current.attempt_id != session.attempt_id
            }))
    }

    async fn retire_superseded(
        &self,
        session: &VerificationSession,
    ) -> anyhow::Result<DispatchOutcome> {
        info!(group_id = session.group_id, "Session superseded by a new one in the same group");
        self.delete_prompt(session).await;

        self.sessions
            .remove_resolved(session.user_id, session.attempt_id)
            .context("Failed to delete superseded session")?;

        Ok(DispatchOutcome::SessionRetired)
    }

    async fn admit_member(&self, session: &VerificationSession) -> anyhow::Result<DispatchOutcome> {
        let (group_id, user_id) = (session.group_id, session.user_id);
        info!(group_id, "Member passed verification");

        if session.restrict_applied {
            if let Err(e) = self.chat.restrict_send(group_id, user_id, true).await {
                error!(group_id, user_id, error = ?e, "Failed to lift send restriction");
            }
        }

        self.notify(user_id, OutgoingMessage::plain(PASSED_TEXT)).await;
        self.delete_prompt(session).await;

        self.roster
            .record(
                group_id,
                user_id,
                session.username.clone(),
                session.verification_type.clone(),
                session.proof_token.clone().unwrap_or_default(),
            )
            .context("Failed to record verified user")?;

        self.sessions
            .remove_resolved(user_id, session.attempt_id)
            .context("Failed to delete verified session")?;

        counter!("verification_passed", "role" => "member").increment(1);
        Ok(DispatchOutcome::MemberAdmitted)
    }

    async fn report_self_test(
        &self,
        session: &VerificationSession,
    ) -> anyhow::Result<DispatchOutcome> {
        let (group_id, user_id) = (session.group_id, session.user_id);
        info!(group_id, "Administrator self-test passed");

        let diagnostic = self.self_test_diagnostic(group_id);
        let report = serde_json::to_string_pretty(&diagnostic)
            .context("Failed to format self-test diagnostic")?;
        self.notify(
            user_id,
            OutgoingMessage::markdown(format!(
                "Here is the current verification parameter being tested:\n```\n{report}\n```\n"
            )),
        )
        .await;

        if let Some(token) = session.proof_token.as_ref() {
            let file_name = format!("token_{user_id}.txt");
            if let Err(e) = self
                .chat
                .send_document(user_id, &file_name, token.as_bytes().to_vec())
                .await
            {
                warn!(user_id, error = ?e, "Failed to export proof token");
            }
        }

        self.notify(user_id, OutgoingMessage::plain(SELF_TEST_PASSED_TEXT))
            .await;
        self.delete_prompt(session).await;

        self.sessions
            .remove_resolved(user_id, session.attempt_id)
            .context("Failed to delete self-test session")?;
        self.roster
            .remove(group_id, user_id)
            .context("Failed to remove administrator from roster")?;

        counter!("verification_passed", "role" => "administrator").increment(1);
        Ok(DispatchOutcome::SelfTestReported)
    }

    async fn remove_member(&self, session: &VerificationSession) -> anyhow::Result<DispatchOutcome> {
        let (group_id, user_id) = (session.group_id, session.user_id);
        let reason = session.failure.unwrap_or(FailureReason::Rejected);
        info!(group_id, %reason, "Member failed verification, removing from group");

        if let Err(e) = self.chat.remove_then_readmit(group_id, user_id).await {
            error!(group_id, user_id, error = ?e, "Failed to remove member from group");
        }

        let text = match reason {
            FailureReason::Rejected => FAILED_TEXT,
            FailureReason::TimedOut => TIMED_OUT_TEXT,
            FailureReason::RemovedByAdmin => REMOVED_TEXT,
            FailureReason::Superseded => SUPERSEDED_TEXT,
        };
        self.notify(user_id, OutgoingMessage::plain(text)).await;
        self.delete_prompt(session).await;

        self.sessions
            .remove_resolved(user_id, session.attempt_id)
            .context("Failed to delete failed session")?;

        counter!("verification_failed", "reason" => reason.to_string()).increment(1);
        Ok(DispatchOutcome::MemberRemoved)
    }

    async fn report_failed_self_test(
        &self,
        session: &VerificationSession,
    ) -> anyhow::Result<DispatchOutcome> {
        let user_id = session.user_id;
        info!(group_id = session.group_id, "Administrator self-test failed");

        let text = match session.failure {
            Some(FailureReason::TimedOut) => SELF_TEST_TIMED_OUT_TEXT,
            Some(FailureReason::Superseded) => SELF_TEST_SUPERSEDED_TEXT,
            _ => SELF_TEST_FAILED_TEXT,
        };
        self.notify(user_id, OutgoingMessage::plain(text)).await;
        self.delete_prompt(session).await;

        self.sessions
            .remove_resolved(user_id, session.attempt_id)
            .context("Failed to delete self-test session")?;

        Ok(DispatchOutcome::SelfTestFailed)
    }

    /// Active parameter set and restriction policy the self-test ran against
    fn self_test_diagnostic(&self, group_id: i64) -> serde_json::Value {
        match self.group_configs.get(group_id) {
            Ok(config) => json!({
                "activeVerificationParam": config.active_params(group_id).ok(),
                "typeRestriction": config.restriction_policy,
            }),
            Err(e) => {
                warn!(group_id, error = ?e, "Group configuration unavailable for self-test report");
                json!({
                    "activeVerificationParam": null,
                    "typeRestriction": null,
                })
            }
        }
    }

    async fn notify(&self, user_id: i64, message: OutgoingMessage) {
        if let Err(e) = self.chat.send_message(user_id, message).await {
            warn!(user_id, error = ?e, "Failed to notify user");
        }
    }

    async fn delete_prompt(&self, session: &VerificationSession) {
        if let Some(prompt) = session.prompt_message {
            if let Err(e) = self.chat.delete_message(prompt).await {
                warn!(user_id = session.user_id, error = ?e, "Failed to delete verification prompt");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::mock::RecordingChatClient;
    use gate_storage::{MessageRef, SessionRole, Storage};

    fn dispatcher() -> (tempfile::TempDir, Storage, Arc<RecordingChatClient>, ModerationDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), 16 * 1024 * 1024).unwrap();
        let chat = Arc::new(RecordingChatClient::new());
        let dispatcher = ModerationDispatcher::new(
            chat.clone(),
            storage.sessions.clone(),
            storage.group_configs.clone(),
            storage.roster.clone(),
        );
        (dir, storage, chat, dispatcher)
    }

    #[tokio::test]
    async fn test_pending_and_deleted_records_are_ignored() {
        let (_dir, storage, chat, dispatcher) = dispatcher();
        let sub = storage.bus.subscribe();

        storage
            .sessions
            .create(VerificationSession::pending(1, -10, SessionRole::Member))
            .unwrap();
        storage.sessions.delete(1).unwrap();

        for event in sub.drain() {
            assert_eq!(
                dispatcher.handle_event(&event).await.unwrap(),
                DispatchOutcome::Ignored
            );
        }
        assert!(chat.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_failure_does_not_delete_newer_session() {
        let (_dir, storage, _chat, dispatcher) = dispatcher();
        let sub = storage.bus.subscribe();

        let first = storage
            .sessions
            .create(VerificationSession::pending(2, -10, SessionRole::Member))
            .unwrap();
        storage
            .sessions
            .mark_failed(2, first.attempt_id, FailureReason::Rejected)
            .unwrap();
        let newer = storage
            .sessions
            .create(VerificationSession::pending(2, -10, SessionRole::Member))
            .unwrap();

        let failed = sub
            .drain()
            .into_iter()
            .find(|event| event.is_terminal())
            .unwrap();
        assert_eq!(
            dispatcher.handle_event(&failed).await.unwrap(),
            DispatchOutcome::MemberRemoved
        );
        assert_eq!(storage.sessions.get(2).unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_superseded_session_in_other_group_removes_member() {
        let (_dir, storage, chat, dispatcher) = dispatcher();
        let first = storage
            .sessions
            .create(VerificationSession::pending(3, -10, SessionRole::Member))
            .unwrap();
        storage.sessions.mark_restricted(3, first.attempt_id).unwrap();
        let sub = storage.bus.subscribe();

        let newer = storage
            .sessions
            .create(VerificationSession::pending(3, -20, SessionRole::Member))
            .unwrap();

        let superseded = sub.drain().into_iter().find(ChangeEvent::is_terminal).unwrap();
        assert_eq!(
            dispatcher.handle_event(&superseded).await.unwrap(),
            DispatchOutcome::MemberRemoved
        );
        assert_eq!(
            chat.calls().first(),
            Some(&crate::chat::mock::ChatCall::RemoveThenReadmit {
                group_id: -10,
                user_id: 3,
            })
        );
        assert_eq!(chat.texts_sent_to(3), vec![SUPERSEDED_TEXT]);
        assert_eq!(storage.sessions.get(3).unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_superseded_session_in_same_group_is_retired() {
        let (_dir, storage, chat, dispatcher) = dispatcher();
        let mut first = VerificationSession::pending(4, -10, SessionRole::Member);
        let prompt = MessageRef {
            chat_id: -10,
            message_id: 9,
        };
        first.prompt_message = Some(prompt);
        storage.sessions.create(first).unwrap();
        let sub = storage.bus.subscribe();

        storage
            .sessions
            .create(VerificationSession::pending(4, -10, SessionRole::Member))
            .unwrap();

        let superseded = sub.drain().into_iter().find(ChangeEvent::is_terminal).unwrap();
        assert_eq!(
            dispatcher.handle_event(&superseded).await.unwrap(),
            DispatchOutcome::SessionRetired
        );
        assert_eq!(
            chat.calls(),
            vec![crate::chat::mock::ChatCall::DeleteMessage(prompt)]
        );
        assert!(storage.sessions.get(4).unwrap().is_some_and(|s| s.pending));
    }

    #[tokio::test]
    async fn test_replay_handles_resolved_records_once() {
        let (_dir, storage, chat, dispatcher) = dispatcher();
        for user in [5, 6] {
            let session = storage
                .sessions
                .create(VerificationSession::pending(user, -10, SessionRole::Member))
                .unwrap();
            storage
                .sessions
                .mark_failed(user, session.attempt_id, FailureReason::TimedOut)
                .unwrap();
        }
        storage
            .sessions
            .create(VerificationSession::pending(7, -10, SessionRole::Member))
            .unwrap();

        let replayed = dispatcher.replay_resolved().await;
        assert_eq!(replayed.len(), 2);
        assert_eq!(storage.sessions.get(5).unwrap(), None);
        assert_eq!(storage.sessions.get(6).unwrap(), None);
        assert!(storage.sessions.get(7).unwrap().is_some());

        let removals = chat
            .calls()
            .into_iter()
            .filter(|call| matches!(call, crate::chat::mock::ChatCall::RemoveThenReadmit { .. }))
            .count();
        assert_eq!(removals, 2);
        assert!(dispatcher.replay_resolved().await.is_empty());
    }
}
