//! In-memory collaborators shared by the unit tests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

use crate::agent::{Agent, Collaborators};
use crate::api::{ApiError, ApiResponse, ControllerApi};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::patches::{PatchError, PatchManager, WinUpdate};
use crate::rpc::transport::{Transport, TransportError};
use crate::runner::RunnerError;
use crate::scheduler::{SchedTask, SchedulerError, TaskScheduler};
use crate::services::{ServiceAction, ServiceError, ServiceInfo, ServiceManager, ServiceStatus};
use crate::state::{now_unix, State};
use crate::update::{UpdateError, UpdateRequest, Updater};

type Handler = dyn Fn(&Method, &str, Option<&Value>) -> Result<ApiResponse, ApiError> + Send + Sync;
type Call = (Method, String, Option<Value>);

pub struct FakeApi {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl FakeApi {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Method, &str, Option<&Value>) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answers every request with 200 and `body`.
    pub fn ok(body: &str) -> Arc<Self> {
        let body = body.to_string();
        Self::new(move |_, _, _| {
            Ok(ApiResponse {
                status: 200,
                body: body.clone(),
            })
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControllerApi for FakeApi {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        _timeout: Duration,
    ) -> Result<ApiResponse, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.clone(), path.to_string(), body.cloned()));
        (self.handler)(&method, path, body)
    }
}

/// Services exist once given a status. Control calls are recorded and move
/// the status the way a real service manager would.
#[derive(Default)]
pub struct FakeServices {
    statuses: Mutex<BTreeMap<String, ServiceStatus>>,
    queries: Mutex<HashMap<String, usize>>,
    refused: Mutex<Vec<(String, ServiceAction)>>,
    actions: Mutex<HashMap<String, Vec<ServiceAction>>>,
    detached_restarts: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus) {
        self.statuses.lock().unwrap().insert(name.to_string(), status);
    }

    pub fn fail_control(&self, name: &str, action: ServiceAction) {
        self.refused.lock().unwrap().push((name.to_string(), action));
    }

    pub fn status_queries(&self, name: &str) -> usize {
        self.queries.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn actions(&self, name: &str) -> Vec<ServiceAction> {
        self.actions.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn detached_restarts(&self) -> Vec<String> {
        self.detached_restarts.lock().unwrap().clone()
    }

    fn lookup(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        self.statuses
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    fn info(name: &str, status: ServiceStatus) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            status: status.as_str().to_string(),
            display_name: name.to_string(),
            ..ServiceInfo::default()
        }
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn list(&self) -> Result<Vec<ServiceInfo>, ServiceError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(name, status)| Self::info(name, *status))
            .collect())
    }

    async fn detail(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        self.lookup(name).map(|status| Self::info(name, status))
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        *self.queries.lock().unwrap().entry(name.to_string()).or_default() += 1;
        self.lookup(name)
    }

    async fn control(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError> {
        self.actions
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(action);
        self.lookup(name)?;
        let refused = self
            .refused
            .lock()
            .unwrap()
            .iter()
            .any(|(n, a)| n == name && *a == action);
        if refused {
            return Err(ServiceError::Command(RunnerError::ExitStatus {
                exe: "service-manager".to_string(),
                code: 2,
                stderr: "access denied".to_string(),
            }));
        }
        let next = match action {
            ServiceAction::Stop => ServiceStatus::Stopped,
            ServiceAction::Start | ServiceAction::Restart => ServiceStatus::Running,
        };
        self.set_status(name, next);
        Ok(())
    }

    async fn set_start_type(&self, name: &str, _start_type: &str) -> Result<(), ServiceError> {
        self.lookup(name).map(|_| ())
    }

    async fn restart_detached(&self, name: &str) -> Result<(), ServiceError> {
        self.lookup(name)?;
        self.detached_restarts.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeScheduler {
    tasks: Mutex<BTreeMap<String, bool>>,
}

#[async_trait]
impl TaskScheduler for FakeScheduler {
    async fn create(&self, task: &SchedTask) -> Result<(), SchedulerError> {
        if task.name.is_empty() {
            return Err(SchedulerError::Invalid("task name is empty".to_string()));
        }
        self.tasks
            .lock()
            .unwrap()
            .insert(task.name.clone(), task.enabled);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SchedulerError> {
        self.tasks
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::Invalid(format!("task {name:?} not found")))
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        match self.tasks.lock().unwrap().get_mut(name) {
            Some(flag) => {
                *flag = enabled;
                Ok(())
            }
            None => Err(SchedulerError::Invalid(format!("task {name:?} not found"))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.tasks.lock().unwrap().keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct FakePatches {
    pub available: Vec<WinUpdate>,
    installed: Mutex<Vec<String>>,
}

impl FakePatches {
    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PatchManager for FakePatches {
    async fn scan(&self) -> Result<Vec<WinUpdate>, PatchError> {
        Ok(self.available.clone())
    }

    async fn install(&self, guid: &str) -> Result<bool, PatchError> {
        self.installed.lock().unwrap().push(guid.to_string());
        Ok(true)
    }

    async fn needs_reboot(&self) -> Result<bool, PatchError> {
        Ok(!self.installed.lock().unwrap().is_empty())
    }
}

/// Counts calls. A gated updater blocks every update until [`release`]
/// is called once per update.
///
/// [`release`]: FakeUpdater::release
#[derive(Default)]
pub struct FakeUpdater {
    gate: Option<Notify>,
    fail: bool,
    updates: AtomicUsize,
    uninstalls: AtomicUsize,
}

impl FakeUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Notify::new()),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn uninstall_calls(&self) -> usize {
        self.uninstalls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Updater for FakeUpdater {
    async fn update(&self, request: &UpdateRequest) -> Result<(), UpdateError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(UpdateError::InvalidInstaller(request.inno.clone()));
        }
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), UpdateError> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One published message: subject, reply subject, payload.
type Published = (String, Option<String>, Vec<u8>);

#[derive(Default)]
pub struct FakeTransport {
    published: Mutex<Vec<Published>>,
    flushes: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Plain publishes to `subject`, i.e. responses.
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, reply, _)| s == subject && reply.is_none())
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    /// Publishes carrying `name` as reply subject, i.e. notifications.
    pub fn notifications(&self, name: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, reply, _)| reply.as_deref() == Some(name))
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), None, payload));
        Ok(())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.published.lock().unwrap().push((
            subject.to_string(),
            Some(reply.to_string()),
            payload,
        ));
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Minimal configuration with instant service polling.
pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(
        "agent_id: test-agent\nagent_pk: 7\ntoken: secret\nserver: http://127.0.0.1:1\n",
    )
    .expect("test config parses");
    cfg.public_ip_urls = Vec::new();
    cfg.program_dir = std::env::temp_dir();
    cfg.checks.cpu_sample_secs = 0;
    cfg.recovery.service_poll_secs = 0;
    cfg.recovery.service_wait_retries = 2;
    cfg
}

#[derive(Default)]
pub struct TestCollaborators {
    pub services: Option<Arc<FakeServices>>,
    pub scheduler: Option<Arc<FakeScheduler>>,
    pub patches: Option<Arc<FakePatches>>,
    pub updater: Option<Arc<FakeUpdater>>,
}

pub fn build_agent(cfg: Config, api: Arc<FakeApi>, fakes: TestCollaborators) -> Arc<Agent> {
    let collaborators = Collaborators {
        api,
        services: fakes.services.unwrap_or_else(FakeServices::new),
        scheduler: fakes.scheduler.unwrap_or_default(),
        patches: fakes.patches.unwrap_or_default(),
        updater: fakes.updater.unwrap_or_else(FakeUpdater::new),
    };
    let state = State::new(now_unix()).with_identity(&cfg.agent_id, crate::agent::VERSION);
    Agent::new(
        cfg,
        collaborators,
        Metrics::new().expect("metrics registry"),
        Arc::new(RwLock::new(state)),
    )
    .expect("agent builds")
}

pub fn test_agent(api: Arc<FakeApi>) -> Arc<Agent> {
    build_agent(test_config(), api, TestCollaborators::default())
}

pub fn agent_with_config(cfg: Config, api: Arc<FakeApi>) -> Arc<Agent> {
    build_agent(cfg, api, TestCollaborators::default())
}

pub fn agent_with_services(api: Arc<FakeApi>, services: Arc<FakeServices>) -> Arc<Agent> {
    build_agent(
        test_config(),
        api,
        TestCollaborators {
            services: Some(services),
            ..TestCollaborators::default()
        },
    )
}

pub fn agent_with_collaborators(api: Arc<FakeApi>, fakes: TestCollaborators) -> Arc<Agent> {
    build_agent(test_config(), api, fakes)
}

/// Polls `condition` on the real clock, failing the test after ten seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
