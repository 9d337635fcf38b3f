pub mod config;
pub mod environment;
pub mod error;

pub use config::BotConfig;
pub use environment::Environment;
pub use error::{AdminError, AdminResult, LifecycleError, LifecycleResult};
