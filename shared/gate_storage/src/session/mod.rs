//! Verification session storage
//!
//! A session tracks one user's verification for one group. It starts pending and
//! ends either verified or failed. Every write runs as a single read-modify-write
//! transaction and is published on the [`EventBus`] once it has committed.

mod error;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::events::{ChangeEvent, EventBus};
use crate::store::{record_key, Collection, Mutation, RecordStore};

pub use error::{SessionStorageError, SessionStorageResult};

/// Who a session was created for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionRole {
    /// A new group member who must verify before taking part
    #[default]
    Member,
    /// A group administrator testing the configured verification
    Administrator,
}

/// Why a session ended without verifying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// The verifier rejected the submitted proof
    Rejected,
    /// No proof arrived before the deadline
    TimedOut,
    /// An administrator removed the user
    RemovedByAdmin,
    /// The user started verifying for another group before finishing this one
    Superseded,
}

/// Reference to a chat message the bot sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

/// Derived lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Pending,
    Verified,
    Failed,
}

/// Persisted verification session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub user_id: i64,
    pub group_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub group_title: Option<String>,
    pub pending: bool,
    pub verified: bool,
    pub restrict_applied: bool,
    #[serde(default)]
    pub role: SessionRole,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Prompt shown in the group, deleted once the session resolves
    #[serde(default)]
    pub prompt_message: Option<MessageRef>,
    #[serde(default)]
    pub proof_token: Option<String>,
    /// Request descriptor handed to the user, used verbatim to check the returned proof
    #[serde(default)]
    pub issued_request: Option<serde_json::Value>,
    #[serde(default)]
    pub verification_type: Option<String>,
    /// Distinguishes successive sessions for the same user
    pub attempt_id: Uuid,
    pub created_at: i64,
}

impl VerificationSession {
    /// Builds a fresh pending session with a new attempt id
    #[must_use]
    pub fn pending(user_id: i64, group_id: i64, role: SessionRole) -> Self {
        Self {
            user_id,
            group_id,
            username: None,
            group_title: None,
            pending: true,
            verified: false,
            restrict_applied: false,
            role,
            failure: None,
            prompt_message: None,
            proof_token: None,
            issued_request: None,
            verification_type: None,
            attempt_id: Uuid::new_v4(),
            created_at: Utc::now().timestamp(),
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    #[must_use]
    pub fn with_group_title(mut self, group_title: Option<String>) -> Self {
        self.group_title = group_title;
        self
    }

    /// Lifecycle state; the verified flag is ignored while pending
    #[must_use]
    pub const fn state(&self) -> SessionState {
        if self.pending {
            SessionState::Pending
        } else if self.verified {
            SessionState::Verified
        } else {
            SessionState::Failed
        }
    }

    #[must_use]
    pub fn is_administrator(&self) -> bool {
        self.role == SessionRole::Administrator
    }

    /// Session id handed to the verifying party
    #[must_use]
    pub const fn session_id(&self) -> i64 {
        self.user_id
    }
}

/// Session storage publishing every committed write
pub struct SessionStorage {
    store: Arc<RecordStore>,
    bus: EventBus,
    commit_lock: Mutex<()>,
}

impl SessionStorage {
    /// Creates a new session storage over `store`, publishing on `bus`
    #[must_use]
    pub const fn new(store: Arc<RecordStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            commit_lock: Mutex::new(()),
        }
    }

    /// Bus this storage publishes on
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Gets the session for a user
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store read fails
    pub fn get(&self, user_id: i64) -> SessionStorageResult<Option<VerificationSession>> {
        Ok(self
            .store
            .get(Collection::UserSessions, &record_key(user_id))?)
    }

    /// Lists every session that is still pending
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store scan fails
    pub fn pending_sessions(&self) -> SessionStorageResult<Vec<VerificationSession>> {
        self.scan(|session| session.pending)
    }

    /// Lists every resolved session whose record has not been removed yet
    ///
    /// These are outcomes committed before the dispatcher acted on them.
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store scan fails
    pub fn resolved_sessions(&self) -> SessionStorageResult<Vec<VerificationSession>> {
        self.scan(|session| !session.pending)
    }

    fn scan(
        &self,
        keep: impl Fn(&VerificationSession) -> bool,
    ) -> SessionStorageResult<Vec<VerificationSession>> {
        Ok(self
            .store
            .scan_prefix::<VerificationSession>(Collection::UserSessions, &[])?
            .into_iter()
            .map(|(_, session)| session)
            .filter(keep)
            .collect())
    }

    /// Runs one transition and publishes its result after commit
    ///
    /// Holding `commit_lock` across commit and publish keeps the bus order equal to the
    /// commit order. Aborted or failed transitions publish nothing.
    fn commit_with<F>(&self, user_id: i64, f: F) -> SessionStorageResult<Option<ChangeEvent>>
    where
        F: FnOnce(Option<VerificationSession>) -> SessionStorageResult<Mutation<VerificationSession>>,
    {
        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let committed = self.commit_locked(user_id, f)?;
        Ok(committed.map(|snapshot| self.bus.publish(user_id, snapshot)))
    }

    /// Commits one transition without publishing; the caller holds `commit_lock`
    ///
    /// Returns the committed snapshot, or `None` if the transition aborted.
    fn commit_locked<F>(
        &self,
        user_id: i64,
        f: F,
    ) -> SessionStorageResult<Option<Option<VerificationSession>>>
    where
        F: FnOnce(Option<VerificationSession>) -> SessionStorageResult<Mutation<VerificationSession>>,
    {
        self.store.modify(
            Collection::UserSessions,
            &record_key(user_id),
            |current: Option<VerificationSession>| {
                let mutation = f(current)?;
                let snapshot = match &mutation {
                    Mutation::Put(session) => Some(Some(session.clone())),
                    Mutation::Delete => Some(None),
                    Mutation::Abort => None,
                };
                Ok::<_, SessionStorageError>((mutation, snapshot))
            },
        )
    }

    /// Applies `update` to the pending session, provided it is still the attempt `attempt_id`
    fn update_pending<F>(
        &self,
        user_id: i64,
        attempt_id: Uuid,
        update: F,
    ) -> SessionStorageResult<VerificationSession>
    where
        F: FnOnce(&mut VerificationSession),
    {
        let event = self.commit_with(user_id, |current| {
            let mut session = current.ok_or(SessionStorageError::NotFound(user_id))?;
            if session.attempt_id != attempt_id {
                return Err(SessionStorageError::Replaced(user_id));
            }
            if !session.pending {
                return Err(SessionStorageError::NotPending(user_id));
            }
            update(&mut session);
            Ok(Mutation::Put(session))
        })?;

        event
            .and_then(|event| event.session)
            .ok_or(SessionStorageError::NotFound(user_id))
    }

    /// Stores a new pending session, replacing any previous session for the user
    ///
    /// A previous session that is still pending is first committed as failed with
    /// [`FailureReason::Superseded`], so its restriction and prompt get cleaned up. Both
    /// changes are published together once the new session has committed.
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store write fails
    pub fn create(&self, session: VerificationSession) -> SessionStorageResult<VerificationSession> {
        let user_id = session.user_id;
        let group_id = session.group_id;
        let role = session.role;

        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let superseded = self.commit_locked(user_id, |previous| {
            Ok(match previous {
                Some(mut previous) if previous.pending => {
                    previous.pending = false;
                    previous.verified = false;
                    previous.failure = Some(FailureReason::Superseded);
                    Mutation::Put(previous)
                }
                Some(previous) => {
                    tracing::info!(
                        user_id,
                        previous_group_id = previous.group_id,
                        previous_state = %previous.state(),
                        "Replacing resolved verification session"
                    );
                    Mutation::Abort
                }
                None => Mutation::Abort,
            })
        })?;

        let created = self.commit_locked(user_id, |_| Ok(Mutation::Put(session.clone())))?;

        if let Some(snapshot) = superseded {
            if let Some(previous) = snapshot.as_ref() {
                tracing::info!(
                    user_id,
                    previous_group_id = previous.group_id,
                    "Pending verification session superseded"
                );
            }
            self.bus.publish(user_id, snapshot);
        }
        if let Some(snapshot) = created {
            self.bus.publish(user_id, snapshot);
        }

        tracing::info!(user_id, group_id, %role, "Created verification session");
        Ok(session)
    }

    /// Records that the user's send right was revoked
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError::NotFound` or `NotPending` if there is no pending
    /// session, `Replaced` if the session is no longer the attempt `attempt_id`, or a
    /// store error
    pub fn mark_restricted(
        &self,
        user_id: i64,
        attempt_id: Uuid,
    ) -> SessionStorageResult<VerificationSession> {
        self.update_pending(user_id, attempt_id, |session| {
            session.restrict_applied = true;
        })
    }

    /// Binds the prompt message shown to the user
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError::NotFound` or `NotPending` if there is no pending
    /// session, `Replaced` if the session is no longer the attempt `attempt_id`, or a
    /// store error
    pub fn bind_prompt_message(
        &self,
        user_id: i64,
        attempt_id: Uuid,
        message: MessageRef,
    ) -> SessionStorageResult<VerificationSession> {
        self.update_pending(user_id, attempt_id, |session| session.prompt_message = Some(message))
    }

    /// Stores the request descriptor issued to the user
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError::NotFound` or `NotPending` if there is no pending
    /// session, `Replaced` if the session is no longer the attempt `attempt_id`, or a
    /// store error
    pub fn attach_request(
        &self,
        user_id: i64,
        attempt_id: Uuid,
        request: serde_json::Value,
        verification_type: Option<String>,
    ) -> SessionStorageResult<VerificationSession> {
        self.update_pending(user_id, attempt_id, |session| {
            session.issued_request = Some(request);
            session.verification_type = verification_type;
        })
    }

    /// Transitions `pending -> verified`, keeping the proof token
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError::NotFound` or `NotPending` if there is no pending
    /// session, `Replaced` if the session is no longer the attempt `attempt_id`, or a
    /// store error
    pub fn mark_verified(
        &self,
        user_id: i64,
        attempt_id: Uuid,
        proof_token: String,
    ) -> SessionStorageResult<VerificationSession> {
        let session = self.update_pending(user_id, attempt_id, |session| {
            session.pending = false;
            session.verified = true;
            session.proof_token = Some(proof_token);
        })?;
        tracing::info!(user_id, group_id = session.group_id, "Session verified");
        Ok(session)
    }

    /// Transitions `pending -> failed`
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError::NotFound` or `NotPending` if there is no pending
    /// session, `Replaced` if the session is no longer the attempt `attempt_id`, or a
    /// store error
    pub fn mark_failed(
        &self,
        user_id: i64,
        attempt_id: Uuid,
        reason: FailureReason,
    ) -> SessionStorageResult<VerificationSession> {
        let session = self.update_pending(user_id, attempt_id, |session| {
            session.pending = false;
            session.verified = false;
            session.failure = Some(reason);
        })?;
        tracing::info!(user_id, group_id = session.group_id, %reason, "Session failed");
        Ok(session)
    }

    /// Evicts the session if it is still the pending attempt `attempt_id`
    ///
    /// Returns `None` without writing anything when the session is gone, already
    /// terminal, or belongs to a newer attempt.
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store transaction fails
    pub fn evict_if_pending(
        &self,
        user_id: i64,
        attempt_id: Uuid,
    ) -> SessionStorageResult<Option<VerificationSession>> {
        let event = self.commit_with(user_id, |current| {
            Ok(match current {
                Some(mut session) if session.pending && session.attempt_id == attempt_id => {
                    session.pending = false;
                    session.verified = false;
                    session.failure = Some(FailureReason::TimedOut);
                    Mutation::Put(session)
                }
                _ => Mutation::Abort,
            })
        })?;

        Ok(event.and_then(|event| event.session))
    }

    /// Deletes a resolved session, but only if it is still the attempt `attempt_id`
    ///
    /// A session re-created for the same user in the meantime is left alone.
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store transaction fails
    pub fn remove_resolved(&self, user_id: i64, attempt_id: Uuid) -> SessionStorageResult<bool> {
        let event = self.commit_with(user_id, |current| {
            Ok(match current {
                Some(session) if !session.pending && session.attempt_id == attempt_id => {
                    Mutation::Delete
                }
                _ => Mutation::Abort,
            })
        })?;
        Ok(event.is_some())
    }

    /// Deletes the session record, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store transaction fails
    pub fn delete(&self, user_id: i64) -> SessionStorageResult<bool> {
        let event = self.commit_with(user_id, |current| {
            Ok(if current.is_some() {
                Mutation::Delete
            } else {
                Mutation::Abort
            })
        })?;
        Ok(event.is_some())
    }
}
