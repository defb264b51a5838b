//! Periodic handshake with the controller.
//!
//! The controller piggybacks instructions on the check-in response: a
//! recovery mode to run, a shell command to launch, or a new agent version to
//! install.

use rand::Rng;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{Agent, VERSION};
use crate::api::{plain_string, to_value, ApiError};
use crate::host::{self, DiskUsage};
use crate::recovery::{self, RecoveryMode};
use crate::rpc::guard::Flights;
use crate::state::now_unix;
use crate::update::UpdateRequest;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Recover(RecoveryMode),
    Command(String),
    Update(UpdateRequest),
}

#[derive(Serialize)]
struct Startup<'a> {
    agent_id: &'a str,
    hostname: &'a str,
}

#[derive(Serialize)]
struct Hello<'a> {
    agent_id: &'a str,
    hostname: String,
    operating_system: String,
    total_ram: u64,
    plat: String,
    public_ip: String,
    disks: Vec<DiskUsage>,
    version: &'a str,
    boot_time: u64,
}

/// Extracts the instructions from a check-in response body. An empty body or
/// `ok` carries none; anything unparsable is logged and ignored.
pub fn parse_directives(body: &str) -> Vec<Directive> {
    let text = plain_string(body);
    if text.is_empty() || text == "ok" {
        return Vec::new();
    }
    let data: Value = match serde_json::from_str(body) {
        Ok(data @ Value::Object(_)) => data,
        Ok(other) => {
            debug!(body = %other, "ignoring non-object check-in response");
            return Vec::new();
        }
        Err(err) => {
            warn!(error = %err, "undecodable check-in response");
            return Vec::new();
        }
    };
    let field = |key: &str| data.get(key).and_then(Value::as_str);

    let mut directives = Vec::new();
    match field("recovery") {
        Some("command") => {
            if let Some(cmd) = field("cmd") {
                directives.push(Directive::Command(cmd.to_string()));
            }
        }
        Some(mode) => match RecoveryMode::parse(mode) {
            Some(mode) => directives.push(Directive::Recover(mode)),
            None => debug!(mode, "ignoring unknown recovery mode"),
        },
        None => {}
    }
    if let (Some(version), Some(inno), Some(url)) = (field("version"), field("inno"), field("url")) {
        directives.push(Directive::Update(UpdateRequest {
            url: url.to_string(),
            inno: inno.to_string(),
            version: version.to_string(),
        }));
    }
    directives
}

pub struct Checkin {
    agent: Arc<Agent>,
    flights: Arc<Flights>,
}

impl Checkin {
    pub fn new(agent: Arc<Agent>, flights: Arc<Flights>) -> Self {
        Self { agent, flights }
    }

    /// Announces the agent once at service start.
    pub async fn startup(&self) -> Result<(), ApiError> {
        let facts = tokio::task::spawn_blocking(host::host_facts).await.ok();
        let hostname = facts.map(|f| f.hostname).unwrap_or_default();
        let payload = to_value(&Startup {
            agent_id: self.agent.agent_id(),
            hostname: &hostname,
        })?;
        self.agent.controller.hello(Method::POST, &payload).await?;
        info!("agent announced to controller");
        Ok(())
    }

    /// Sends one check-in and returns the instructions in the response.
    pub async fn checkin_once(&self) -> Result<Vec<Directive>, ApiError> {
        let agent = &self.agent;
        let facts = tokio::task::spawn_blocking(host::host_facts).await.ok();
        let public_ip = host::public_ip(&agent.http, &agent.config.public_ip_urls).await;
        let hello = match facts {
            Some(facts) => Hello {
                agent_id: agent.agent_id(),
                hostname: facts.hostname,
                operating_system: facts.operating_system,
                total_ram: (facts.total_ram as f64 / GIB).ceil() as u64,
                plat: facts.platform,
                public_ip,
                disks: facts.disks,
                version: VERSION,
                boot_time: facts.boot_time,
            },
            None => Hello {
                agent_id: agent.agent_id(),
                hostname: String::new(),
                operating_system: String::new(),
                total_ram: 0,
                plat: std::env::consts::OS.to_string(),
                public_ip,
                disks: Vec::new(),
                version: VERSION,
                boot_time: 0,
            },
        };
        let payload = to_value(&hello)?;

        match agent.controller.hello(Method::PATCH, &payload).await {
            Ok(response) => {
                agent.metrics.inc_checkin("ok");
                agent.state.write().await.record_checkin(now_unix());
                Ok(parse_directives(&response.body))
            }
            Err(err) => {
                agent.metrics.inc_checkin("error");
                Err(err)
            }
        }
    }

    pub async fn apply(&self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Recover(mode) => recovery::recover(&self.agent, mode).await,
                Directive::Command(cmd) => recovery::recover_command(&cmd),
                Directive::Update(request) => self.update(&request).await,
            }
        }
    }

    async fn update(&self, request: &UpdateRequest) {
        let Some(_guard) = self.flights.agent_update.try_acquire() else {
            debug!("agent update already running, skipping check-in update");
            return;
        };
        info!(version = %request.version, "controller requested agent update");
        if let Err(err) = self.agent.updater.update(request).await {
            warn!(error = %err, "agent update from check-in failed");
        }
    }

    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.startup().await {
            warn!(error = %err, "startup announcement failed");
        }
        loop {
            match self.checkin_once().await {
                Ok(directives) => self.apply(directives).await,
                Err(err) => warn!(error = %err, "check-in failed"),
            }
            let pause = self.next_pause();
            debug!(secs = pause.as_secs(), "next check-in scheduled");
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("check-in loop stopped");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn next_pause(&self) -> Duration {
        let cfg = &self.agent.config.checkin;
        let secs = if cfg.max_secs > cfg.min_secs {
            rand::thread_rng().gen_range(cfg.min_secs..=cfg.max_secs)
        } else {
            cfg.min_secs
        };
        Duration::from_secs(secs)
    }
}
