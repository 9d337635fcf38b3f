//! Verification deadlines
//!
//! Every new session gets one timer. When it fires, the session is evicted if it is still
//! the same pending attempt; otherwise the timer does nothing. Timers are not cancelled
//! when a session resolves early.

use std::sync::Arc;
use std::time::Duration;

use gate_storage::{SessionStorage, SessionStorageResult, VerificationSession};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Schedules and fires per-session eviction timers
#[derive(Clone)]
pub struct TimeoutSupervisor {
    sessions: Arc<SessionStorage>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl TimeoutSupervisor {
    /// Creates a new `TimeoutSupervisor`
    #[must_use]
    pub const fn new(
        sessions: Arc<SessionStorage>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            timeout,
            shutdown,
        }
    }

    /// Grace period given to every new session
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the deadline for a newly created session
    pub fn watch(&self, session: &VerificationSession) -> JoinHandle<()> {
        self.watch_after(session.user_id, session.attempt_id, self.timeout)
    }

    fn watch_after(&self, user_id: i64, attempt_id: Uuid, delay: Duration) -> JoinHandle<()> {
        let supervisor = self.clone();
        debug!(user_id, %attempt_id, delay_secs = delay.as_secs(), "Scheduled verification deadline");

        tokio::spawn(async move {
            tokio::select! {
                () = supervisor.shutdown.cancelled() => {
                    debug!(user_id, "Verification deadline abandoned on shutdown");
                }
                () = tokio::time::sleep(delay) => {
                    supervisor.fire(user_id, attempt_id);
                }
            }
        })
    }

    fn fire(&self, user_id: i64, attempt_id: Uuid) {
        match self.expire(user_id, attempt_id) {
            Ok(Some(session)) => {
                info!(
                    user_id,
                    group_id = session.group_id,
                    "Verification deadline passed, session evicted"
                );
                counter!("session_evicted").increment(1);
            }
            Ok(None) => {
                debug!(user_id, "Verification deadline passed after session resolved");
            }
            Err(e) => {
                error!(user_id, error = ?e, "Failed to evict expired session");
            }
        }
    }

    /// Evicts the session if it is still the pending attempt `attempt_id`
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the store transaction fails
    pub fn expire(
        &self,
        user_id: i64,
        attempt_id: Uuid,
    ) -> SessionStorageResult<Option<VerificationSession>> {
        self.sessions.evict_if_pending(user_id, attempt_id)
    }

    /// Re-arms deadlines for sessions left pending by a previous run
    ///
    /// Each timer fires when the remainder of its grace period has elapsed,
    /// immediately if the period is already over.
    ///
    /// # Errors
    ///
    /// Returns `SessionStorageError` if the pending sessions cannot be listed
    pub fn resume_pending(&self) -> SessionStorageResult<Vec<JoinHandle<()>>> {
        let now = chrono::Utc::now().timestamp();
        let pending = self.sessions.pending_sessions()?;

        info!(count = pending.len(), "Resuming verification deadlines");

        Ok(pending
            .iter()
            .map(|session| {
                let elapsed = u64::try_from(now - session.created_at).unwrap_or(0);
                let remaining = self.timeout.saturating_sub(Duration::from_secs(elapsed));
                self.watch_after(session.user_id, session.attempt_id, remaining)
            })
            .collect())
    }
}
