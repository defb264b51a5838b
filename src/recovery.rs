//! Self-healing routines for the agent's own services and its companions.
//!
//! Each routine stops a service, waits for it to settle, runs a remediation
//! step and restarts the service. The restart is unconditional: the
//! remediation runs in its own task so that even a panic there is caught and
//! logged before the start is issued.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::runner::{kill_matching, run_command, spawn_detached_shell};
use crate::services::{wait_for_status, ServiceAction, ServiceStatus};

const SALT_SETTLE: Duration = Duration::from_secs(2);
const MESH_NODE_ID_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_DNS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Salt,
    Mesh,
    Rpc,
    CheckRunner,
    TacticalAgent,
}

impl RecoveryMode {
    /// Unknown modes yield `None` and are ignored by callers.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "salt" => Some(RecoveryMode::Salt),
            "mesh" => Some(RecoveryMode::Mesh),
            "rpc" => Some(RecoveryMode::Rpc),
            "checkrunner" => Some(RecoveryMode::CheckRunner),
            "tacagent" => Some(RecoveryMode::TacticalAgent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryMode::Salt => "salt",
            RecoveryMode::Mesh => "mesh",
            RecoveryMode::Rpc => "rpc",
            RecoveryMode::CheckRunner => "checkrunner",
            RecoveryMode::TacticalAgent => "tacagent",
        }
    }

    fn service<'a>(self, agent: &'a Agent) -> &'a str {
        let cfg = &agent.config.recovery;
        match self {
            RecoveryMode::Salt => &cfg.salt_service,
            RecoveryMode::Mesh => &cfg.mesh_service,
            RecoveryMode::Rpc => &cfg.rpc_service,
            RecoveryMode::CheckRunner => &cfg.checkrunner_service,
            RecoveryMode::TacticalAgent => &cfg.agent_service,
        }
    }
}

pub async fn recover(agent: &Arc<Agent>, mode: RecoveryMode) {
    info!(mode = mode.as_str(), "recovery started");
    let service = mode.service(agent).to_string();
    match mode {
        RecoveryMode::Salt => {
            let agent_ref = agent.clone();
            restart_around(agent, &service, async move { remediate_salt(&agent_ref).await }).await;
        }
        RecoveryMode::Mesh => {
            let agent_ref = agent.clone();
            restart_around(agent, &service, async move { remediate_mesh(&agent_ref).await }).await;
        }
        RecoveryMode::Rpc | RecoveryMode::CheckRunner | RecoveryMode::TacticalAgent => {
            if agent.config.recovery.hosted_services.contains(&service) {
                // Stopping it here would kill this process before the start.
                match agent.services.restart_detached(&service).await {
                    Ok(()) => info!(service = %service, "own service restart handed off"),
                    Err(err) => {
                        warn!(service = %service, error = %err, "own service restart not launched")
                    }
                }
                return;
            }
            restart_around(agent, &service, async {}).await;
        }
    }
    info!(mode = mode.as_str(), "recovery finished");
}

/// Launches `command` detached through the platform shell.
pub fn recover_command(command: &str) {
    match spawn_detached_shell(command) {
        Ok(pid) => info!(pid, "recovery command launched"),
        Err(err) => warn!(error = %err, "failed to launch recovery command"),
    }
}

async fn restart_around<F>(agent: &Arc<Agent>, service: &str, remediation: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    stop_service(agent, service).await;
    if let Err(err) = tokio::spawn(remediation).await {
        error!(service, error = %err, "recovery remediation panicked");
    }
    if let Err(err) = agent.services.control(service, ServiceAction::Start).await {
        warn!(service, error = %err, "failed to start service after recovery");
    }
}

async fn stop_service(agent: &Agent, service: &str) {
    if let Err(err) = agent.services.control(service, ServiceAction::Stop).await {
        debug!(service, error = %err, "stop during recovery failed");
    }
    let stopped = wait_for_status(
        agent.services.as_ref(),
        service,
        ServiceStatus::Stopped,
        agent.config.recovery.service_wait_retries,
        agent.service_poll(),
    )
    .await;
    if !stopped {
        warn!(service, "service did not stop in time, continuing recovery");
    }
}

async fn remediate_salt(agent: &Agent) {
    let killed = tokio::task::spawn_blocking(|| {
        kill_matching(|name, exe| {
            let name = name.to_ascii_lowercase();
            (name == "python.exe" || name == "python") && exe.to_ascii_lowercase().contains("salt")
        })
    })
    .await
    .unwrap_or(0);
    debug!(killed, "salt processes terminated");
    tokio::time::sleep(SALT_SETTLE).await;

    let cache = &agent.config.recovery.salt_cache_dir;
    match tokio::fs::remove_dir_all(cache).await {
        Ok(()) => debug!(path = %cache.display(), "salt cache cleared"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %cache.display(), error = %err, "failed to clear salt cache"),
    }
    flush_dns().await;
}

async fn flush_dns() {
    let result = if cfg!(windows) {
        run_command("ipconfig", &["/flushdns"], FLUSH_DNS_TIMEOUT).await
    } else {
        run_command("resolvectl", &["flush-caches"], FLUSH_DNS_TIMEOUT).await
    };
    if let Err(err) = result.and_then(|out| out.into_result("flush dns", FLUSH_DNS_TIMEOUT)) {
        debug!(error = %err, "dns flush failed");
    }
}

async fn remediate_mesh(agent: &Agent) {
    let killed = tokio::task::spawn_blocking(|| {
        kill_matching(|name, _| name.to_ascii_lowercase().contains("meshagent"))
    })
    .await
    .unwrap_or(0);
    debug!(killed, "mesh agent processes terminated");
    sync_mesh_node_id(agent).await;
}

fn mesh_exe(agent: &Agent) -> PathBuf {
    if let Some(path) = agent.config.recovery.mesh_exe.clone() {
        return path;
    }
    if cfg!(windows) {
        let program_files =
            std::env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".to_string());
        let installed = PathBuf::from(program_files).join("Mesh Agent").join("MeshAgent.exe");
        if installed.exists() {
            return installed;
        }
        agent.config.program_dir.join("meshagent.exe")
    } else {
        PathBuf::from("/opt/tacticalmesh/meshagent")
    }
}

/// Reads the local mesh node id and pushes it to the controller when it
/// differs from what the controller has on record.
pub async fn sync_mesh_node_id(agent: &Agent) {
    let exe = mesh_exe(agent);
    let exe_text = exe.to_string_lossy().into_owned();
    let local = match run_command(&exe_text, &["-nodeidhex"], MESH_NODE_ID_TIMEOUT).await {
        Ok(out) => out.stdout.trim().to_string(),
        Err(err) => {
            debug!(error = %err, "mesh node id unavailable");
            return;
        }
    };
    if local.is_empty() || local.contains("not defined") {
        debug!("mesh node id not assigned yet");
        return;
    }
    let remote = match agent.controller.mesh_node_id().await {
        Ok(remote) => remote,
        Err(err) => {
            debug!(error = %err, "failed to read mesh node id from controller");
            return;
        }
    };
    if remote != local {
        if let Err(err) = agent.controller.set_mesh_node_id(&local).await {
            warn!(error = %err, "failed to update mesh node id");
        } else {
            info!(node_id = %local, "mesh node id synced");
        }
    }
}
