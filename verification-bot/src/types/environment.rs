//! Environment configuration for different deployment stages

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Default verification deadline for new members
const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default LMDB map size in MiB
const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Default wallet deep link prefix, followed by the base64 request
const DEFAULT_WALLET_DEEP_LINK_BASE: &str = "https://wallet.privado.id/#i_m=";

/// Application environment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// Production environment
    Production,
    /// Staging environment
    Staging,
    /// Development environment
    Development {
        /// Optional override for the verification deadline in seconds
        verification_timeout_override: Option<u64>,
    },
}

impl Environment {
    /// Creates an Environment from the `APP_ENV` environment variable
    ///
    /// # Panics
    ///
    /// Panics if `APP_ENV` contains an invalid value
    #[must_use]
    pub fn from_env() -> Self {
        let env = env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .trim()
            .to_lowercase();

        match env.as_str() {
            "production" => Self::Production,
            "staging" => Self::Staging,
            "development" => {
                let verification_timeout_override = env::var("VERIFICATION_TIMEOUT_SECS")
                    .ok()
                    .and_then(|val| val.parse::<u64>().ok());

                Self::Development {
                    verification_timeout_override,
                }
            }
            _ => panic!("Invalid environment: {env}"),
        }
    }

    /// Directory holding the record store
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        env::var("DATABASE_PATH").map_or_else(
            |_| match self {
                Self::Production | Self::Staging => PathBuf::from("/var/lib/verification-bot"),
                Self::Development { .. } => PathBuf::from("./data"),
            },
            PathBuf::from,
        )
    }

    /// Maximum size of the record store in bytes
    #[must_use]
    pub fn database_map_size(&self) -> usize {
        env::var("DATABASE_MAP_SIZE_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAP_SIZE_MB)
            * 1024
            * 1024
    }

    /// How long a new member has to verify
    #[must_use]
    pub const fn verification_timeout(&self) -> Duration {
        match self {
            Self::Production | Self::Staging => DEFAULT_VERIFICATION_TIMEOUT,
            Self::Development {
                verification_timeout_override,
            } => match verification_timeout_override {
                Some(secs) => Duration::from_secs(*secs),
                None => DEFAULT_VERIFICATION_TIMEOUT,
            },
        }
    }

    /// Prefix of the wallet link the encoded verification request is appended to
    #[must_use]
    pub fn wallet_deep_link_base(&self) -> String {
        env::var("WALLET_DEEP_LINK_BASE")
            .unwrap_or_else(|_| DEFAULT_WALLET_DEEP_LINK_BASE.to_string())
    }

    #[must_use]
    pub fn tracing_level(&self) -> Level {
        env::var("TRACING_LEVEL")
            .ok()
            .and_then(|val| val.parse::<Level>().ok())
            .unwrap_or(match self {
                Self::Production | Self::Staging => Level::INFO,
                Self::Development { .. } => Level::DEBUG,
            })
    }

    /// Installs the global tracing subscriber
    ///
    /// JSON output for staging and production, human readable output for development.
    /// Does nothing if a subscriber is already installed.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::builder()
            .with_default_directive(self.tracing_level().into())
            .from_env_lossy();

        let installed = match self {
            Self::Production | Self::Staging => {
                fmt().json().with_env_filter(filter).try_init()
            }
            Self::Development { .. } => fmt().with_env_filter(filter).try_init(),
        };

        if installed.is_err() {
            tracing::debug!("Tracing subscriber already installed");
        }
    }
}
