use std::sync::Arc;
use std::time::Duration;

use crate::archive::ArchiveManager;
use crate::auth::Authenticator;
use crate::builtins::BuiltinContext;
use crate::capability::{AdminActors, CapabilityGate};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::exec::ToolRunner;
use crate::rate_limit::RateLimiter;
use crate::secret::SecretManager;
use crate::store::{EphemeralStore, MemoryStore};
use crate::util::Clock;

#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<ServerConfig>,
    secrets: Arc<SecretManager>,
    auth: Arc<Authenticator>,
    limiter: Arc<RateLimiter>,
    gate: Arc<dyn CapabilityGate>,
    archives: Arc<ArchiveManager>,
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn build(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, reqwest::Error> {
        let shared: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::new());
        let secrets = Arc::new(SecretManager::new(
            shared.clone(),
            config.secret_path(),
            config.shared_secret.clone(),
        ));
        let auth = Arc::new(Authenticator::new(
            secrets.clone(),
            shared.clone(),
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            shared.clone(),
            clock.clone(),
            config.rate_limit,
            config.rate_window_secs,
        ));
        let archives = Arc::new(ArchiveManager::new(
            config.archive_dir(),
            shared,
            clock,
        ));
        let http = reqwest::Client::builder()
            .user_agent(concat!("foundry-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        let dispatcher = Arc::new(Dispatcher::new(BuiltinContext {
            app_root: config.app_root.clone(),
            state_dir: config.state_dir.clone(),
            runner: ToolRunner::new(
                config.wp_bin.clone(),
                config.app_root.clone(),
                config.cache_dir.clone(),
            ),
            archives: archives.clone(),
            install_dir: config.install_dir.clone(),
            update_url: config.update_url.clone(),
            http,
        }));
        let gate: Arc<dyn CapabilityGate> = Arc::new(AdminActors::new(config.admin_actors.clone()));
        Ok(Self {
            config: Arc::new(config),
            secrets,
            auth,
            limiter,
            gate,
            archives,
            dispatcher,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn secrets(&self) -> &SecretManager {
        &self.secrets
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn gate(&self) -> &dyn CapabilityGate {
        self.gate.as_ref()
    }

    pub fn archives(&self) -> &ArchiveManager {
        &self.archives
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
