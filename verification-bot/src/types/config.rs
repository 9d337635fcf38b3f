//! Runtime settings shared by the bot services

use std::path::PathBuf;
use std::time::Duration;

use super::Environment;

/// Settings resolved once at startup and handed to every service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Directory holding the record store
    pub database_path: PathBuf,
    /// Maximum record store size in bytes
    pub database_map_size: usize,
    /// How long a new member has to verify before being removed
    pub verification_timeout: Duration,
    /// Prefix of the wallet link the encoded request is appended to
    pub wallet_deep_link_base: String,
}

impl BotConfig {
    /// Resolves every setting for the given environment
    #[must_use]
    pub fn from_environment(env: &Environment) -> Self {
        Self {
            database_path: env.database_path(),
            database_map_size: env.database_map_size(),
            verification_timeout: env.verification_timeout(),
            wallet_deep_link_base: env.wallet_deep_link_base(),
        }
    }
}
