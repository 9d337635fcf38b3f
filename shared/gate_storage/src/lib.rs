//! Durable state for the group verification gate
//!
//! This crate owns everything the verification bot persists: pending and resolved
//! verification sessions, per-group verification configuration, admin-to-group links
//! and the per-group roster of verified users. Session writes are published on an
//! in-process change bus after they commit.

pub mod admin_link;
pub mod events;
pub mod group_config;
pub mod roster;
pub mod session;
pub mod store;

use std::path::Path;
use std::sync::Arc;

pub use admin_link::{AdminLink, AdminLinkStorage};
pub use events::{ChangeEvent, EventBus, Subscription};
pub use group_config::{
    GroupConfigError, GroupConfigResult, GroupConfigStorage, GroupVerificationConfig,
    RestrictionPolicy, VerificationParams,
};
pub use roster::{RosterStorage, VerifiedUser};
pub use session::{
    FailureReason, MessageRef, SessionRole, SessionState, SessionStorage, SessionStorageError,
    SessionStorageResult, VerificationSession,
};
pub use store::{Collection, Mutation, RecordStore, StoreError, StoreResult};

/// All storage handles opened against one record store
#[derive(Clone)]
pub struct Storage {
    pub store: Arc<RecordStore>,
    pub bus: EventBus,
    pub sessions: Arc<SessionStorage>,
    pub group_configs: Arc<GroupConfigStorage>,
    pub admin_links: Arc<AdminLinkStorage>,
    pub roster: Arc<RosterStorage>,
}

impl Storage {
    /// Opens (or creates) the record store at `path` and wires every storage handle to it
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the directory cannot be created or the LMDB environment
    /// cannot be opened
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> StoreResult<Self> {
        let store = Arc::new(RecordStore::open(path, map_size)?);
        Ok(Self::from_store(store))
    }

    /// Wires storage handles to an already opened record store
    #[must_use]
    pub fn from_store(store: Arc<RecordStore>) -> Self {
        let bus = EventBus::new();

        Self {
            sessions: Arc::new(SessionStorage::new(store.clone(), bus.clone())),
            group_configs: Arc::new(GroupConfigStorage::new(store.clone())),
            admin_links: Arc::new(AdminLinkStorage::new(store.clone())),
            roster: Arc::new(RosterStorage::new(store.clone())),
            store,
            bus,
        }
    }
}
