//! In-process change bus for committed session writes
//!
//! Every subscriber owns an unbounded channel, so a slow consumer never causes events
//! to be dropped and each subscriber sees the same sequence in publish order.

use std::sync::{Arc, Mutex, PoisonError};

use crate::session::VerificationSession;

/// A committed change to one user's session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Monotonic publish sequence, starting at 1
    pub sequence: u64,
    /// User whose record changed
    pub user_id: i64,
    /// Record after the write, `None` when the record was deleted
    pub session: Option<VerificationSession>,
}

impl ChangeEvent {
    /// Whether the write left the session in a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.pending)
    }
}

#[derive(Default)]
struct BusState {
    last_sequence: u64,
    subscribers: Vec<flume::Sender<ChangeEvent>>,
}

/// Broadcast bus for [`ChangeEvent`]s
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    /// Creates a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber that receives every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = flume::unbounded();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push(sender);
        Subscription { receiver }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Assigns the next sequence number and delivers the event to every live subscriber
    ///
    /// Subscribers whose receiving side was dropped are pruned.
    pub fn publish(&self, user_id: i64, session: Option<VerificationSession>) -> ChangeEvent {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_sequence += 1;

        let event = ChangeEvent {
            sequence: state.last_sequence,
            user_id,
            session,
        };

        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());

        tracing::debug!(
            sequence = event.sequence,
            user_id,
            subscribers = state.subscribers.len(),
            "Published session change"
        );

        event
    }
}

/// Receiving end of one bus subscription
pub struct Subscription {
    receiver: flume::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Waits for the next event
    ///
    /// Returns `None` once the bus has been dropped and every queued event was drained.
    pub async fn recv(&self) -> Option<ChangeEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Returns the next queued event without waiting
    #[must_use]
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains every event queued so far
    #[must_use]
    pub fn drain(&self) -> Vec<ChangeEvent> {
        self.receiver.drain().collect()
    }
}
