//! Per-group roster of verified users
//!
//! Entries are keyed by `group_id ++ user_id`, so one group's roster is a single prefix
//! scan. A user appears once per group; verifying again under another scheme adds the
//! scheme's type to the existing entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{composite_key, record_key, Collection, Mutation, RecordStore, StoreError, StoreResult};

/// A verified member of one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedUser {
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    /// Credential types the user has passed in this group
    pub verification_types: BTreeSet<String>,
    /// Most recent proof token
    pub proof_token: String,
    pub verified_at: i64,
}

/// Verified-user roster storage
pub struct RosterStorage {
    store: Arc<RecordStore>,
}

impl RosterStorage {
    /// Creates a new roster storage over `store`
    #[must_use]
    pub const fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Adds a user to a group's roster or merges the new verification into their entry
    ///
    /// # Arguments
    ///
    /// * `group_id` - Group the user verified for
    /// * `user_id` - Verified user
    /// * `username` - Display name, kept from the previous entry when `None`
    /// * `verification_type` - Credential type passed, if the scheme names one
    /// * `proof_token` - Token that passed verification
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read-modify-write fails
    pub fn record(
        &self,
        group_id: i64,
        user_id: i64,
        username: Option<String>,
        verification_type: Option<String>,
        proof_token: String,
    ) -> StoreResult<VerifiedUser> {
        let entry = self.store.modify(
            Collection::VerifiedUsers,
            &composite_key(group_id, user_id),
            |current: Option<VerifiedUser>| {
                let mut entry = current.unwrap_or_else(|| VerifiedUser {
                    user_id,
                    username: None,
                    verification_types: BTreeSet::new(),
                    proof_token: String::new(),
                    verified_at: 0,
                });
                if username.is_some() {
                    entry.username = username;
                }
                entry.verification_types.extend(verification_type);
                entry.proof_token = proof_token;
                entry.verified_at = chrono::Utc::now().timestamp();
                Ok::<_, StoreError>((Mutation::Put(entry.clone()), entry))
            },
        )?;

        tracing::info!(
            group_id,
            user_id,
            types = entry.verification_types.len(),
            "Recorded verified user"
        );
        Ok(entry)
    }

    /// Lists a group's verified users ordered by user id key
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the scan fails
    pub fn list(&self, group_id: i64) -> StoreResult<Vec<VerifiedUser>> {
        Ok(self
            .store
            .scan_prefix::<VerifiedUser>(Collection::VerifiedUsers, &record_key(group_id))?
            .into_iter()
            .map(|(_, user)| user)
            .collect())
    }

    /// Gets one roster entry
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails
    pub fn get(&self, group_id: i64, user_id: i64) -> StoreResult<Option<VerifiedUser>> {
        self.store
            .get(Collection::VerifiedUsers, &composite_key(group_id, user_id))
    }

    /// Removes one user from a group's roster, returning whether they were listed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails
    pub fn remove(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        self.store
            .delete(Collection::VerifiedUsers, &composite_key(group_id, user_id))
    }

    /// Removes a group's whole roster, returning how many entries were removed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails
    pub fn clear(&self, group_id: i64) -> StoreResult<usize> {
        let removed = self
            .store
            .delete_prefix(Collection::VerifiedUsers, &record_key(group_id))?;
        tracing::info!(group_id, removed, "Cleared verified users");
        Ok(removed)
    }
}
