use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::api::{ApiError, Controller, ControllerApi, HttpApi};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::patches::{PatchManager, WuaPatchManager};
use crate::runner::ScriptRunner;
use crate::scheduler::{SchtasksScheduler, TaskScheduler};
use crate::services::{self, ServiceManager};
use crate::state::State;
use crate::update::{InstallerUpdater, Updater};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cannot locate agent executable: {0}")]
    CurrentExe(#[from] std::io::Error),
}

/// The OS- and network-facing collaborators, swappable in tests.
pub struct Collaborators {
    pub api: Arc<dyn ControllerApi>,
    pub services: Arc<dyn ServiceManager>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub patches: Arc<dyn PatchManager>,
    pub updater: Arc<dyn Updater>,
}

/// Everything a check, task, RPC handler or recovery routine needs.
pub struct Agent {
    pub config: Config,
    pub controller: Controller,
    pub services: Arc<dyn ServiceManager>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub patches: Arc<dyn PatchManager>,
    pub updater: Arc<dyn Updater>,
    pub runner: ScriptRunner,
    pub http: Client,
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<State>>,
}

impl Agent {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<State>>,
    ) -> Result<Arc<Self>, AgentError> {
        let http = plain_client()?;
        let controller = Controller::new(collaborators.api, config.agent_id.clone(), config.agent_pk);
        Ok(Arc::new(Self {
            runner: ScriptRunner::new(config.python_bin.clone()),
            controller,
            services: collaborators.services,
            scheduler: collaborators.scheduler,
            patches: collaborators.patches,
            updater: collaborators.updater,
            http,
            metrics,
            state,
            config,
        }))
    }

    /// Wires the real platform backends.
    pub fn from_config(
        config: Config,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<State>>,
    ) -> Result<Arc<Self>, AgentError> {
        let runner = ScriptRunner::new(config.python_bin.clone());
        let collaborators = Collaborators {
            api: Arc::new(HttpApi::new(&config, VERSION)?),
            services: services::platform_default(),
            scheduler: Arc::new(SchtasksScheduler::new(std::env::current_exe()?)),
            patches: Arc::new(WuaPatchManager::new(runner)),
            updater: Arc::new(InstallerUpdater::new(plain_client()?, config.program_dir.clone())),
        };
        Self::new(config, collaborators, metrics, state)
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn service_poll(&self) -> Duration {
        Duration::from_secs(self.config.recovery.service_poll_secs)
    }
}

/// Client for non-controller downloads (public IP, installers).
fn plain_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(format!("rmmagent/{VERSION}"))
        .build()
}
