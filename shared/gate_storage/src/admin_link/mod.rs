//! Admin-to-group links
//!
//! Remembers which group an administrator is configuring so commands sent in a private
//! chat apply to that group. The latest link wins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{record_id, record_key, Collection, RecordStore, StoreResult};

/// Group an administrator is currently configuring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminLink {
    pub group_id: i64,
    #[serde(default)]
    pub group_title: Option<String>,
    pub linked_at: i64,
}

/// Admin link storage
pub struct AdminLinkStorage {
    store: Arc<RecordStore>,
}

impl AdminLinkStorage {
    /// Creates a new admin link storage over `store`
    #[must_use]
    pub const fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Links an administrator to a group, replacing any previous link
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails
    pub fn link(
        &self,
        admin_id: i64,
        group_id: i64,
        group_title: Option<String>,
    ) -> StoreResult<AdminLink> {
        let link = AdminLink {
            group_id,
            group_title,
            linked_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .put(Collection::AdminLinks, &record_key(admin_id), &link)?;
        tracing::info!(admin_id, group_id, "Linked administrator to group");
        Ok(link)
    }

    /// Gets the group an administrator is configuring
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails
    pub fn get(&self, admin_id: i64) -> StoreResult<Option<AdminLink>> {
        self.store.get(Collection::AdminLinks, &record_key(admin_id))
    }

    /// Administrators currently linked to `group_id`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the scan fails
    pub fn admins_for(&self, group_id: i64) -> StoreResult<Vec<i64>> {
        Ok(self
            .store
            .scan_prefix::<AdminLink>(Collection::AdminLinks, &[])?
            .into_iter()
            .filter(|(_, link)| link.group_id == group_id)
            .filter_map(|(key, _)| record_id(&key))
            .collect())
    }

    /// Removes an administrator's link, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails
    pub fn unlink(&self, admin_id: i64) -> StoreResult<bool> {
        self.store
            .delete(Collection::AdminLinks, &record_key(admin_id))
    }
}
