use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use gate_storage::Storage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminService;
use crate::chat::ChatClient;
use crate::dispatcher::ModerationDispatcher;
use crate::lifecycle::LifecycleService;
use crate::supervisor::TimeoutSupervisor;
use crate::types::{BotConfig, Environment};
use crate::zkp::IdentityVerifier;

/// A running verification bot
///
/// Owns the record store, the dispatcher task and the verification timers. Chat updates
/// and proof callbacks are fed in through [`Self::lifecycle`] and [`Self::admin`].
pub struct VerificationBot {
    storage: Storage,
    lifecycle: Arc<LifecycleService>,
    admin: Arc<AdminService>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl VerificationBot {
    /// Initializes tracing and starts the bot with settings from `environment`
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be opened or pending sessions cannot be
    /// resumed
    pub fn start(
        environment: &Environment,
        chat: Arc<dyn ChatClient>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> anyhow::Result<Self> {
        environment.init_tracing();
        Self::start_with_config(BotConfig::from_environment(environment), chat, verifier)
    }

    /// Starts the bot with explicit settings
    ///
    /// Sessions left pending by a previous run get their remaining grace period. Outcomes it
    /// committed but never acted on are handled by the dispatcher before any new change.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be opened or pending sessions cannot be
    /// resumed
    pub fn start_with_config(
        config: BotConfig,
        chat: Arc<dyn ChatClient>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> anyhow::Result<Self> {
        let storage = Storage::open(&config.database_path, config.database_map_size)
            .with_context(|| {
                format!(
                    "Failed to open record store at {}",
                    config.database_path.display()
                )
            })?;
        let shutdown = CancellationToken::new();

        // Subscribe before anything can commit so no change is missed
        let subscription = storage.bus.subscribe();
        let dispatcher = ModerationDispatcher::new(
            chat.clone(),
            storage.sessions.clone(),
            storage.group_configs.clone(),
            storage.roster.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run(subscription, shutdown.clone()));

        let supervisor = TimeoutSupervisor::new(
            storage.sessions.clone(),
            config.verification_timeout,
            shutdown.clone(),
        );
        let mut tasks = vec![dispatcher_task];
        tasks.extend(
            supervisor
                .resume_pending()
                .context("Failed to resume pending verification sessions")?,
        );

        let admin = Arc::new(AdminService::new(
            storage.sessions.clone(),
            storage.group_configs.clone(),
            storage.admin_links.clone(),
            storage.roster.clone(),
            chat.clone(),
        ));
        let lifecycle = Arc::new(LifecycleService::new(
            config,
            storage.sessions.clone(),
            storage.group_configs.clone(),
            storage.admin_links.clone(),
            chat,
            verifier,
            supervisor,
        ));

        tracing::info!("✅ Verification bot started");

        Ok(Self {
            storage,
            lifecycle,
            admin,
            shutdown,
            tasks,
        })
    }

    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<LifecycleService> {
        &self.lifecycle
    }

    #[must_use]
    pub const fn admin(&self) -> &Arc<AdminService> {
        &self.admin
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Token cancelled when the bot shuts down
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the dispatcher and every timer, waiting for them to finish
    pub async fn shutdown(self) {
        tracing::info!("Shutting down verification bot");
        self.shutdown.cancel();

        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = ?e, "Background task ended abnormally");
            }
        }

        tracing::info!("Verification bot stopped");
    }
}
