//! Per-group verification configuration
//!
//! A group holds an append-only list of verification parameter sets, the index of the
//! set used for new requests and the policy applied to unverified joiners.

mod error;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::store::{record_key, Collection, Mutation, RecordStore};

pub use error::{GroupConfigError, GroupConfigResult};

/// How unverified joiners are handled while their session is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RestrictionPolicy {
    /// Revoke the joiner's right to send messages
    Block,
    /// Delete every message the joiner sends
    Delete,
}

/// One verification scheme configured for a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationParams {
    #[serde(rename = "circuitId")]
    pub circuit_id: String,
    /// Caller-chosen request id
    pub id: u32,
    /// Opaque query forwarded to the verifier
    pub query: serde_json::Map<String, serde_json::Value>,
}

impl VerificationParams {
    /// Credential type named by the query, if any
    #[must_use]
    pub fn verification_type(&self) -> Option<&str> {
        self.query.get("type").and_then(serde_json::Value::as_str)
    }

    /// Checks that every field a verification request needs is present
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::InvalidParams` naming the first missing field
    pub fn validate(&self) -> GroupConfigResult<()> {
        if self.circuit_id.trim().is_empty() {
            return Err(GroupConfigError::InvalidParams(
                "circuitId must not be empty".to_string(),
            ));
        }
        if self.id == 0 {
            return Err(GroupConfigError::InvalidParams(
                "id must be non-zero".to_string(),
            ));
        }
        if self.query.is_empty() {
            return Err(GroupConfigError::InvalidParams(
                "query must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stored configuration of one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVerificationConfig {
    pub verification_params: Vec<VerificationParams>,
    /// `None` only until the first parameter set is added
    pub active_index: Option<usize>,
    pub restriction_policy: Option<RestrictionPolicy>,
}

impl GroupVerificationConfig {
    /// Returns the active parameter set of group `group_id`
    ///
    /// # Errors
    ///
    /// Returns `NotConfigured` when there are no parameter sets and
    /// `InvalidActiveIndex` when the index does not reference one
    pub fn active_params(&self, group_id: i64) -> GroupConfigResult<&VerificationParams> {
        if self.verification_params.is_empty() {
            return Err(GroupConfigError::NotConfigured(group_id));
        }
        self.active_index
            .and_then(|index| self.verification_params.get(index))
            .ok_or(GroupConfigError::InvalidActiveIndex {
                group_id,
                index: self.active_index,
                len: self.verification_params.len(),
            })
    }
}

/// Group configuration storage
pub struct GroupConfigStorage {
    store: Arc<RecordStore>,
}

impl GroupConfigStorage {
    /// Creates a new group configuration storage over `store`
    #[must_use]
    pub const fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Reads the full configuration of a group
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::NotConfigured` if the group has no parameter sets, or a
    /// store error
    pub fn get(&self, group_id: i64) -> GroupConfigResult<GroupVerificationConfig> {
        self.store
            .get::<GroupVerificationConfig>(Collection::GroupConfigs, &record_key(group_id))?
            .filter(|config| !config.verification_params.is_empty())
            .ok_or(GroupConfigError::NotConfigured(group_id))
    }

    /// Reads the parameter set used for new verification requests
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::NotConfigured` if the group has no parameter sets,
    /// `GroupConfigError::InvalidActiveIndex` if the stored index is out of range, or a
    /// store error
    pub fn active_params(&self, group_id: i64) -> GroupConfigResult<VerificationParams> {
        let config = self.get(group_id)?;
        config.active_params(group_id).cloned()
    }

    /// Appends a parameter set, selecting it when the group had none active
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::InvalidParams` if the set is incomplete, or a store error
    pub fn append(
        &self,
        group_id: i64,
        params: VerificationParams,
    ) -> GroupConfigResult<GroupVerificationConfig> {
        params.validate()?;

        let config = self.store.modify(
            Collection::GroupConfigs,
            &record_key(group_id),
            |current: Option<GroupVerificationConfig>| {
                let mut config = current.unwrap_or_default();
                config.verification_params.push(params);
                if config.active_index.is_none() {
                    config.active_index = Some(0);
                }
                Ok::<_, GroupConfigError>((Mutation::Put(config.clone()), config))
            },
        )?;

        tracing::info!(
            group_id,
            total = config.verification_params.len(),
            active_index = ?config.active_index,
            "Appended verification parameters"
        );

        Ok(config)
    }

    /// Sets the restriction policy, returning whether it changed
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::NotConfigured` if the group has no configuration, or a
    /// store error
    pub fn set_restriction_policy(
        &self,
        group_id: i64,
        policy: RestrictionPolicy,
    ) -> GroupConfigResult<bool> {
        let changed = self.store.modify(
            Collection::GroupConfigs,
            &record_key(group_id),
            |current: Option<GroupVerificationConfig>| {
                let mut config = current.ok_or(GroupConfigError::NotConfigured(group_id))?;
                if config.restriction_policy == Some(policy) {
                    return Ok::<_, GroupConfigError>((Mutation::Abort, false));
                }
                config.restriction_policy = Some(policy);
                Ok((Mutation::Put(config), true))
            },
        )?;

        if changed {
            tracing::info!(group_id, %policy, "Restriction policy updated");
        }
        Ok(changed)
    }

    /// Selects the parameter set at `index` for new verification requests
    ///
    /// # Errors
    ///
    /// Returns `GroupConfigError::NotConfigured` if the group has no parameter sets,
    /// `GroupConfigError::InvalidActiveIndex` if `index` is out of range, or a store error
    pub fn switch_active(
        &self,
        group_id: i64,
        index: usize,
    ) -> GroupConfigResult<GroupVerificationConfig> {
        let config = self.store.modify(
            Collection::GroupConfigs,
            &record_key(group_id),
            |current: Option<GroupVerificationConfig>| {
                let mut config = current
                    .filter(|config| !config.verification_params.is_empty())
                    .ok_or(GroupConfigError::NotConfigured(group_id))?;
                if index >= config.verification_params.len() {
                    return Err(GroupConfigError::InvalidActiveIndex {
                        group_id,
                        index: Some(index),
                        len: config.verification_params.len(),
                    });
                }
                config.active_index = Some(index);
                Ok((Mutation::Put(config.clone()), config))
            },
        )?;

        tracing::info!(group_id, active_index = index, "Switched active verification parameters");
        Ok(config)
    }

    /// Removes the group's whole configuration, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails
    pub fn clear(&self, group_id: i64) -> GroupConfigResult<bool> {
        let removed = self
            .store
            .delete(Collection::GroupConfigs, &record_key(group_id))?;
        tracing::info!(group_id, removed, "Cleared verification configuration");
        Ok(removed)
    }
}
