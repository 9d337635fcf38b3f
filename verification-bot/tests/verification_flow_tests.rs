mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    group, member, open_storage, other_group, TestBot, DEEP_LINK_BASE, GROUP_ID, MEMBER_ID,
    OTHER_GROUP_ID, TIMEOUT,
};
use gate_storage::{MessageRef, RestrictionPolicy, SessionRole, SessionState, VerificationSession};
use pretty_assertions::assert_eq;
use verification_bot::chat::mock::{ChatCall, RecordingChatClient};
use verification_bot::lifecycle::JoinOutcome;
use verification_bot::types::LifecycleError;
use verification_bot::zkp::verifier::mock::StaticVerifier;
use verification_bot::zkp::ZkpError;

fn gated(outcome: JoinOutcome) -> VerificationSession {
    match outcome {
        JoinOutcome::Gated(session) => session,
        other => panic!("expected a gated join, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_removes_and_readmits_member() {
    let ctx = TestBot::start();
    ctx.configure_group(Some(RestrictionPolicy::Block));

    let session = gated(
        ctx.bot
            .lifecycle()
            .member_joined(&group(), &member())
            .await
            .unwrap(),
    );
    assert!(session.restrict_applied);
    let prompt = session.prompt_message.expect("prompt bound");
    assert!(ctx.calls().contains(&ChatCall::RestrictSend {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
        allow: false,
    }));

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    ctx.wait_for_removal(MEMBER_ID).await;

    let calls = ctx.calls();
    assert!(calls.contains(&ChatCall::RemoveThenReadmit {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
    }));
    assert!(calls.contains(&ChatCall::DeleteMessage(prompt)));
    assert_eq!(
        ctx.chat.texts_sent_to(MEMBER_ID),
        vec!["You did not complete the verification on time and were removed from the group."]
    );

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_verified_member_is_admitted_and_late_timer_is_ignored() {
    let ctx = TestBot::start();
    ctx.configure_group(Some(RestrictionPolicy::Block));
    let lifecycle = ctx.bot.lifecycle();

    let session = gated(lifecycle.member_joined(&group(), &member()).await.unwrap());
    let link = lifecycle.request_verification(&member()).await.unwrap();
    assert!(link.starts_with(DEEP_LINK_BASE));

    let state = lifecycle
        .complete_verification(MEMBER_ID, "proof-token")
        .await
        .unwrap();
    assert_eq!(state, SessionState::Verified);
    ctx.wait_for_removal(MEMBER_ID).await;

    let calls = ctx.calls();
    assert!(calls.contains(&ChatCall::RestrictSend {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
        allow: true,
    }));
    assert!(calls.contains(&ChatCall::DeleteMessage(
        session.prompt_message.expect("prompt bound")
    )));

    let entry = ctx
        .storage()
        .roster
        .get(GROUP_ID, MEMBER_ID)
        .unwrap()
        .expect("member on roster");
    assert_eq!(entry.proof_token, "proof-token");
    assert_eq!(entry.username.as_deref(), Some("newcomer"));
    assert!(entry.verification_types.contains("KYCAgeCredential"));

    // The first deadline passing changes nothing
    let sub = ctx.storage().bus.subscribe();
    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert!(sub.drain().is_empty());
    assert_eq!(ctx.removals(), 0);

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_proof_is_checked_against_issued_request() {
    let ctx = TestBot::start();
    ctx.configure_group(None);
    let lifecycle = ctx.bot.lifecycle();

    lifecycle.member_joined(&group(), &member()).await.unwrap();
    lifecycle.request_verification(&member()).await.unwrap();
    let issued = ctx
        .storage()
        .sessions
        .get(MEMBER_ID)
        .unwrap()
        .and_then(|session| session.issued_request)
        .expect("request stored on session");

    lifecycle
        .complete_verification(MEMBER_ID, "proof-token")
        .await
        .unwrap();

    let checked = ctx.verifier.checked();
    assert_eq!(checked.len(), 1);
    assert_eq!(checked[0].0, "proof-token");
    assert_eq!(checked[0].1.0, issued);

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_proof_removes_member() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestBot::start_in(dir, StaticVerifier::rejecting());
    ctx.configure_group(Some(RestrictionPolicy::Block));
    let lifecycle = ctx.bot.lifecycle();

    lifecycle.member_joined(&group(), &member()).await.unwrap();
    let state = lifecycle
        .complete_verification(MEMBER_ID, "forged")
        .await
        .unwrap();
    assert_eq!(state, SessionState::Failed);
    ctx.wait_for_removal(MEMBER_ID).await;

    assert_eq!(ctx.removals(), 1);
    assert!(ctx
        .chat
        .texts_sent_to(MEMBER_ID)
        .contains(&"You failed verification and were removed from the group.".to_string()));
    assert_eq!(ctx.storage().roster.get(GROUP_ID, MEMBER_ID).unwrap(), None);

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_verifier_outage_leaves_session_pending() {
    let ctx = TestBot::start();
    ctx.configure_group(None);
    let lifecycle = ctx.bot.lifecycle();
    lifecycle.member_joined(&group(), &member()).await.unwrap();

    ctx.verifier
        .set_verdict(Err(ZkpError::ResolverUnavailable("timeout".to_string())));
    let result = lifecycle.complete_verification(MEMBER_ID, "token").await;
    assert!(matches!(result, Err(LifecycleError::Verifier(_))));
    assert!(lifecycle.is_awaiting_verification(MEMBER_ID).unwrap());

    // A retry once the verifier is back settles the session
    ctx.verifier.set_verdict(Ok(()));
    let state = lifecycle
        .complete_verification(MEMBER_ID, "token")
        .await
        .unwrap();
    assert_eq!(state, SessionState::Verified);

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_proof_for_resolved_session_is_refused() {
    let ctx = TestBot::start();
    ctx.configure_group(None);
    let lifecycle = ctx.bot.lifecycle();
    lifecycle.member_joined(&group(), &member()).await.unwrap();

    lifecycle
        .complete_verification(MEMBER_ID, "token")
        .await
        .unwrap();
    let second = lifecycle.complete_verification(MEMBER_ID, "token").await;
    assert!(matches!(
        second,
        Err(LifecycleError::AlreadyResolved(MEMBER_ID) | LifecycleError::SessionNotFound(MEMBER_ID))
    ));

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_is_skipped_for_admins_and_unconfigured_groups() {
    let ctx = TestBot::start();
    let lifecycle = ctx.bot.lifecycle();

    let outcome = lifecycle.member_joined(&group(), &member()).await.unwrap();
    assert_eq!(outcome, JoinOutcome::SkippedUnconfigured);

    ctx.configure_group(Some(RestrictionPolicy::Block));
    let outcome = lifecycle
        .member_joined(&group(), &common::admin())
        .await
        .unwrap();
    assert_eq!(outcome, JoinOutcome::SkippedAdministrator);

    assert!(ctx.calls().is_empty());
    assert_eq!(ctx.storage().sessions.get(MEMBER_ID).unwrap(), None);

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_verify_without_pending_session() {
    let ctx = TestBot::start();
    ctx.configure_group(None);

    let result = ctx.bot.lifecycle().request_verification(&member()).await;
    let err = result.unwrap_err();
    assert!(matches!(err, LifecycleError::NotAwaitingVerification(MEMBER_ID)));
    assert_eq!(
        err.user_message(),
        "You are not awaiting verification in any group."
    );

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_policy_removes_messages_until_verified() {
    let ctx = TestBot::start();
    ctx.configure_group(Some(RestrictionPolicy::Delete));
    let lifecycle = ctx.bot.lifecycle();

    let session = gated(lifecycle.member_joined(&group(), &member()).await.unwrap());
    assert!(!session.restrict_applied);

    let chatter = MessageRef {
        chat_id: GROUP_ID,
        message_id: 500,
    };
    assert!(lifecycle
        .handle_group_message(&group(), &member(), chatter)
        .await
        .unwrap());
    assert!(ctx.calls().contains(&ChatCall::DeleteMessage(chatter)));

    lifecycle
        .complete_verification(MEMBER_ID, "token")
        .await
        .unwrap();
    ctx.wait_for_removal(MEMBER_ID).await;

    assert!(!lifecycle
        .handle_group_message(&group(), &member(), chatter)
        .await
        .unwrap());
    assert!(!ctx
        .calls()
        .iter()
        .any(|call| matches!(call, ChatCall::RestrictSend { .. })));

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_block_policy_survives_restriction_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestBot::start_with(
        dir,
        RecordingChatClient::new().failing_restrictions(),
        StaticVerifier::accepting(),
    );
    ctx.configure_group(Some(RestrictionPolicy::Block));
    let lifecycle = ctx.bot.lifecycle();

    let session = gated(lifecycle.member_joined(&group(), &member()).await.unwrap());
    assert_eq!(session.state(), SessionState::Pending);
    assert!(!session.restrict_applied);
    assert_eq!(session.group_title.as_deref(), Some("Adults only"));
    assert_eq!(
        ctx.chat.texts_sent_to(GROUP_ID),
        vec!["Hi, @newcomer! Please verify your age by clicking the button below and call /verify command."]
    );

    lifecycle
        .complete_verification(MEMBER_ID, "token")
        .await
        .unwrap();
    ctx.wait_for_removal(MEMBER_ID).await;

    // Nothing to lift when the restriction never took effect
    assert!(!ctx.calls().contains(&ChatCall::RestrictSend {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
        allow: true,
    }));

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_overdue_session() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = open_storage(dir.path());
        let mut stale = VerificationSession::pending(MEMBER_ID, GROUP_ID, SessionRole::Member);
        stale.created_at -= 2 * 3600;
        storage.sessions.create(stale).unwrap();
    }

    let ctx = TestBot::start_in(dir, StaticVerifier::accepting());
    ctx.wait_for_removal(MEMBER_ID).await;

    assert_eq!(ctx.removals(), 1);
    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_proof_settled_after_session_replaced_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestBot::start_in(dir, StaticVerifier::held());
    ctx.configure_group(Some(RestrictionPolicy::Block));
    ctx.configure_other_group(RestrictionPolicy::Block);
    let lifecycle = Arc::clone(ctx.bot.lifecycle());

    lifecycle.member_joined(&group(), &member()).await.unwrap();
    let callback = tokio::spawn({
        let lifecycle = Arc::clone(&lifecycle);
        async move { lifecycle.complete_verification(MEMBER_ID, "old-proof").await }
    });
    while ctx.verifier.checked().is_empty() {
        tokio::task::yield_now().await;
    }

    // The first attempt expires while the verifier is still working
    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    ctx.wait_for_removal(MEMBER_ID).await;
    let newer = gated(
        lifecycle
            .member_joined(&other_group(), &member())
            .await
            .unwrap(),
    );

    ctx.verifier.release();
    let result = callback.await.unwrap();
    assert!(matches!(result, Err(LifecycleError::AlreadyResolved(MEMBER_ID))));

    assert_eq!(ctx.storage().sessions.get(MEMBER_ID).unwrap(), Some(newer));
    assert_eq!(ctx.storage().roster.get(OTHER_GROUP_ID, MEMBER_ID).unwrap(), None);
    assert_eq!(ctx.storage().roster.get(GROUP_ID, MEMBER_ID).unwrap(), None);
    assert!(!ctx.calls().contains(&ChatCall::RestrictSend {
        group_id: OTHER_GROUP_ID,
        user_id: MEMBER_ID,
        allow: true,
    }));

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_joining_another_group_releases_the_first() {
    let ctx = TestBot::start();
    ctx.configure_group(Some(RestrictionPolicy::Block));
    ctx.configure_other_group(RestrictionPolicy::Block);
    let lifecycle = ctx.bot.lifecycle();

    let first = gated(lifecycle.member_joined(&group(), &member()).await.unwrap());
    let first_prompt = first.prompt_message.expect("prompt bound");
    let second = gated(
        lifecycle
            .member_joined(&other_group(), &member())
            .await
            .unwrap(),
    );
    ctx.wait_for_call(&ChatCall::DeleteMessage(first_prompt))
        .await;

    let calls = ctx.calls();
    assert!(calls.contains(&ChatCall::RemoveThenReadmit {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
    }));
    assert!(!calls.contains(&ChatCall::RemoveThenReadmit {
        group_id: OTHER_GROUP_ID,
        user_id: MEMBER_ID,
    }));
    assert!(!calls.contains(&ChatCall::DeleteMessage(
        second.prompt_message.expect("prompt bound")
    )));
    assert_eq!(ctx.storage().sessions.get(MEMBER_ID).unwrap(), Some(second));
    assert!(ctx
        .chat
        .texts_sent_to(MEMBER_ID)
        .iter()
        .any(|text| text.starts_with("You started verifying for another group")));

    ctx.bot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_acts_on_outcome_committed_before_crash() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = open_storage(dir.path());
        let session = storage
            .sessions
            .create(
                VerificationSession::pending(MEMBER_ID, GROUP_ID, SessionRole::Member)
                    .with_username(Some("newcomer".to_string())),
            )
            .unwrap();
        storage
            .sessions
            .mark_restricted(MEMBER_ID, session.attempt_id)
            .unwrap();
        storage
            .sessions
            .mark_verified(MEMBER_ID, session.attempt_id, "proof-token".to_string())
            .unwrap();
    }

    let ctx = TestBot::start_in(dir, StaticVerifier::accepting());
    ctx.wait_for_removal(MEMBER_ID).await;

    let lifted = ChatCall::RestrictSend {
        group_id: GROUP_ID,
        user_id: MEMBER_ID,
        allow: true,
    };
    assert_eq!(
        ctx.calls().iter().filter(|call| **call == lifted).count(),
        1
    );
    let entry = ctx
        .storage()
        .roster
        .get(GROUP_ID, MEMBER_ID)
        .unwrap()
        .expect("member on roster");
    assert_eq!(entry.proof_token, "proof-token");
    assert!(ctx.storage().sessions.resolved_sessions().unwrap().is_empty());

    ctx.bot.shutdown().await;
}
