//! Routes decoded requests to their handlers.
//!
//! The receive loop only decodes and spawns. Each handler runs in its own
//! task, bounded by a semaphore so a flood of requests cannot grow the
//! number of concurrent handlers without limit. Long exclusive operations
//! hold a [`SingleFlight`](super::guard::SingleFlight) guard and answer a
//! busy marker to overlapping calls.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::envelope::{self, DecodeError, Request, ScriptRequest};
use super::guard::Flights;
use super::transport::{Inbound, Transport};
use crate::agent::Agent;
use crate::checks::eventlog::{read_event_log, EventLogEntry};
use crate::checks::CheckEngine;
use crate::host;
use crate::metrics::Metrics;
use crate::patches::{validate_guid, WinUpdate};
use crate::recovery::{self, RecoveryMode};
use crate::runner::{kill_proc, run_command, spawn_detached};
use crate::services::{ServiceAction, ServiceActionResult, ServiceError, ServiceInfo};
use crate::tasks;

pub const BUSY: &str = "busy";
pub const UPDATE_RUNNING: &str = "updaterunning";

const CHOCO_INSTALL_URL: &str = "https://chocolatey.org/install.ps1";
const CHOCO_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CHOCO_TIMEOUT: Duration = Duration::from_secs(900);
const REBOOT_QUERY_DELAY: Duration = Duration::from_secs(5);

/// Terminates the process. Tests swap in a recorder.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

pub fn process_exit() -> ExitFn {
    Arc::new(|code| std::process::exit(code))
}

#[derive(Serialize)]
struct ChocoInstalled<'a> {
    agent_id: &'a str,
    installed: bool,
}

#[derive(Serialize)]
struct WinUpdateScan<'a> {
    agent_id: &'a str,
    wua_updates: &'a [WinUpdate],
}

#[derive(Serialize)]
struct WinUpdateInstallResult<'a> {
    agent_id: &'a str,
    guid: &'a str,
    success: bool,
}

#[derive(Serialize)]
struct NeedsReboot<'a> {
    agent_id: &'a str,
    needsreboot: bool,
}

/// Decrements the in-flight gauge even if the handler panics.
struct InFlight<'a>(&'a Metrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a Metrics) -> Self {
        metrics.agent_rpc_in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.agent_rpc_in_flight.dec();
    }
}

pub struct Dispatcher {
    agent: Arc<Agent>,
    transport: Arc<dyn Transport>,
    checks: CheckEngine,
    flights: Arc<Flights>,
    permits: Arc<Semaphore>,
    exit: ExitFn,
}

impl Dispatcher {
    pub fn new(
        agent: Arc<Agent>,
        transport: Arc<dyn Transport>,
        checks: CheckEngine,
        flights: Arc<Flights>,
        exit: ExitFn,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(agent.config.rpc_max_in_flight));
        Arc::new(Self {
            agent,
            transport,
            checks,
            flights,
            permits,
            exit,
        })
    }

    /// Consumes inbound messages until the stream ends or `shutdown` flips.
    pub async fn run(
        self: &Arc<Self>,
        mut inbound: BoxStream<'static, Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(subject = %self.agent.agent_id(), "rpc dispatcher listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("rpc dispatcher stopped");
                    break;
                }
                msg = inbound.next() => match msg {
                    Some(msg) => self.accept(msg).await,
                    None => {
                        warn!("rpc subscription closed");
                        break;
                    }
                },
            }
        }
    }

    /// Decodes one message and hands it to a handler task. Waits only for a
    /// worker permit, never for the handler itself.
    pub async fn accept(self: &Arc<Self>, msg: Inbound) {
        let request = match envelope::decode(&msg.payload) {
            Ok(request) => request,
            Err(DecodeError::UnknownOp(op)) => {
                debug!(op = %op, "ignoring unsupported rpc operation");
                return;
            }
            Err(err) => {
                error!(error = %err, "dropping undecodable rpc message");
                self.agent.metrics.inc_rpc_decode_error();
                return;
            }
        };
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let op = request.op();
        debug!(op, "rpc request");
        self.agent.metrics.inc_rpc_request(op);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = InFlight::enter(&this.agent.metrics);
            this.handle(request, msg.reply.as_deref()).await;
        });
    }

    async fn handle(&self, request: Request, reply: Option<&str>) {
        let op = request.op();
        let agent = &self.agent;
        match request {
            Request::Ping => self.respond(reply, op, "pong").await,

            Request::KillProc { pid } => {
                let text = match tokio::task::spawn_blocking(move || kill_proc(pid)).await {
                    Ok(Ok(())) => "ok".to_string(),
                    Ok(Err(err)) => err.to_string(),
                    Err(err) => err.to_string(),
                };
                self.respond(reply, op, &text).await;
            }

            Request::RawCmd {
                shell,
                command,
                timeout,
            } => {
                let text = match agent.runner.cmd_shell(&shell, &command, timeout).await {
                    Ok(out) => out.preferred_text().to_string(),
                    Err(err) => err.to_string(),
                };
                self.respond(reply, op, &text).await;
            }

            Request::RunScript(script) => {
                let out = self.run_script(&script).await;
                self.respond(reply, op, &format!("{}{}", out.stdout, out.stderr)).await;
            }

            Request::RunScriptFull(script) => {
                let out = self.run_script(&script).await;
                self.respond(reply, op, &out).await;
            }

            Request::Procs => {
                let procs = tokio::task::spawn_blocking(host::list_processes)
                    .await
                    .unwrap_or_default();
                self.respond(reply, op, &procs).await;
            }

            Request::WinServices => {
                let services = agent.services.list().await.unwrap_or_else(|err| {
                    warn!(error = %err, "failed to list services");
                    Vec::new()
                });
                self.respond(reply, op, &services).await;
            }

            Request::WinSvcDetail { name } => {
                let info = agent.services.detail(&name).await.unwrap_or_else(|err| {
                    debug!(service = %name, error = %err, "service detail unavailable");
                    ServiceInfo {
                        name: name.clone(),
                        status: "n/a".to_string(),
                        ..ServiceInfo::default()
                    }
                });
                self.respond(reply, op, &info).await;
            }

            Request::WinSvcAction { name, action } => {
                let result = match action.parse::<ServiceAction>() {
                    Ok(action) => agent.services.control(&name, action).await,
                    Err(err) => Err(err),
                };
                self.respond(reply, op, &service_result(result)).await;
            }

            Request::EditWinSvc { name, start_type } => {
                let result = agent.services.set_start_type(&name, &start_type).await;
                self.respond(reply, op, &service_result(result)).await;
            }

            Request::EventLog { log_name, days } => {
                let timeout = Duration::from_secs(agent.config.checks.eventlog_timeout_secs);
                let entries: Vec<EventLogEntry> =
                    match read_event_log(&agent.runner, &log_name, days, timeout).await {
                        Ok(entries) => entries,
                        Err(err) => {
                            warn!(log = %log_name, error = %err, "failed to read event log");
                            Vec::new()
                        }
                    };
                self.respond(reply, op, &entries).await;
            }

            Request::SchedTask(task) => {
                let text = ok_or_text(agent.scheduler.create(&task).await);
                self.respond(reply, op, &text).await;
            }

            Request::DelSchedTask { name } => {
                let text = ok_or_text(agent.scheduler.delete(&name).await);
                self.respond(reply, op, &text).await;
            }

            Request::EnableSchedTask(task) => {
                let text = ok_or_text(agent.scheduler.set_enabled(&task.name, task.enabled).await);
                self.respond(reply, op, &text).await;
            }

            Request::ListSchedTasks => {
                let names = agent.scheduler.list().await.unwrap_or_else(|err| {
                    warn!(error = %err, "failed to list scheduled tasks");
                    Vec::new()
                });
                self.respond(reply, op, &names).await;
            }

            Request::Recover { mode } => {
                self.respond(reply, op, "ok").await;
                match RecoveryMode::parse(&mode) {
                    Some(mode) => recovery::recover(agent, mode).await,
                    None => debug!(mode = %mode, "ignoring unknown recovery mode"),
                }
            }

            Request::RecoveryCmd { command } => {
                self.respond(reply, op, "ok").await;
                recovery::recover_command(&command);
            }

            Request::RebootNow => {
                self.respond(reply, op, "ok").await;
                reboot();
            }

            Request::NeedsReboot => {
                let needed = agent.patches.needs_reboot().await.unwrap_or_else(|err| {
                    warn!(error = %err, "failed to query pending reboot");
                    false
                });
                self.respond(reply, op, &needed).await;
            }

            Request::CpuLoadAvg => {
                let window = Duration::from_secs(agent.config.checks.cpu_sample_secs);
                let percent = host::sample_cpu_percent(window).await.round() as i64;
                self.respond(reply, op, &percent).await;
            }

            Request::PublicIp => {
                let ip = host::public_ip(&agent.http, &agent.config.public_ip_urls).await;
                self.respond(reply, op, &ip).await;
            }

            Request::RunChecks => match self.checks.try_begin_pass() {
                None => self.busy(reply, op).await,
                Some(guard) => {
                    self.respond(reply, op, "ok").await;
                    self.checks.run_pass(guard).await;
                }
            },

            Request::RunTask { task_id } => {
                if let Err(err) = tasks::run_task(agent, task_id).await {
                    warn!(task_id, error = %err, "task run failed");
                }
            }

            Request::InstallChoco => self.install_choco().await,

            Request::InstallWithChoco { name, version } => {
                let args = ["install", name.as_str(), "--version", version.as_str(), "--yes"];
                let text = match run_command("choco.exe", &args, CHOCO_TIMEOUT).await {
                    Ok(out) => out.preferred_text().to_string(),
                    Err(err) => err.to_string(),
                };
                self.respond(reply, op, &text).await;
            }

            Request::GetWinUpdates => {
                let Some(_guard) = self.flights.win_update_scan.try_acquire() else {
                    return self.busy(reply, op).await;
                };
                self.respond(reply, op, "ok").await;
                match agent.patches.scan().await {
                    Ok(updates) => {
                        let scan = WinUpdateScan {
                            agent_id: agent.agent_id(),
                            wua_updates: &updates,
                        };
                        self.notify("getwinupdates", &scan).await;
                    }
                    Err(err) => warn!(error = %err, "windows update scan failed"),
                }
            }

            Request::InstallWinUpdates { guids } => {
                let Some(_guard) = self.flights.win_update_install.try_acquire() else {
                    return self.busy(reply, op).await;
                };
                self.respond(reply, op, "ok").await;
                self.install_updates(&guids).await;
            }

            Request::AgentUpdate(update) => {
                let Some(guard) = self.flights.agent_update.try_acquire() else {
                    return self.respond_busy(reply, op, UPDATE_RUNNING).await;
                };
                self.respond(reply, op, "ok").await;
                info!(version = %update.version, "agent update requested");
                let result = agent.updater.update(&update).await;
                drop(guard);
                match result {
                    Ok(()) => self.flush_and_exit().await,
                    Err(err) => error!(error = %err, "agent update failed"),
                }
            }

            Request::Uninstall => {
                self.respond(reply, op, "ok").await;
                if let Err(err) = agent.updater.uninstall().await {
                    error!(error = %err, "uninstall failed");
                }
                self.flush_and_exit().await;
            }
        }
    }

    async fn run_script(&self, script: &ScriptRequest) -> crate::runner::ScriptOutcome {
        let out = self
            .agent
            .runner
            .run_script(&script.code, &script.shell, &script.args, script.timeout)
            .await;
        if out.retcode == crate::runner::EXIT_TIMED_OUT {
            self.agent.metrics.inc_script_timeout();
        }
        out
    }

    async fn install_choco(&self) {
        let agent = &self.agent;
        let installed = match download_text(&agent.http, CHOCO_INSTALL_URL).await {
            Some(script) => {
                let out = agent
                    .runner
                    .run_script(&script, "powershell", &[], CHOCO_TIMEOUT)
                    .await;
                if out.retcode != 0 {
                    warn!(retcode = out.retcode, stderr = %out.stderr.trim(), "chocolatey install failed");
                }
                out.retcode == 0
            }
            None => false,
        };
        let result = ChocoInstalled {
            agent_id: agent.agent_id(),
            installed,
        };
        self.notify("chocoinstall", &result).await;
    }

    async fn install_updates(&self, guids: &[String]) {
        let agent = &self.agent;
        for guid in guids {
            let success = match validate_guid(guid) {
                Ok(()) => agent.patches.install(guid).await.unwrap_or_else(|err| {
                    warn!(guid = %guid, error = %err, "windows update install failed");
                    false
                }),
                Err(err) => {
                    warn!(error = %err, "skipping windows update");
                    false
                }
            };
            let result = WinUpdateInstallResult {
                agent_id: agent.agent_id(),
                guid,
                success,
            };
            self.notify("winupdateresult", &result).await;
        }

        tokio::time::sleep(REBOOT_QUERY_DELAY).await;
        let needsreboot = agent.patches.needs_reboot().await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to query pending reboot");
            false
        });
        let result = NeedsReboot {
            agent_id: agent.agent_id(),
            needsreboot,
        };
        self.notify("needsreboot", &result).await;
    }

    async fn flush_and_exit(&self) {
        if let Err(err) = self.transport.flush().await {
            warn!(error = %err, "flush before exit failed");
        }
        info!("agent exiting");
        (self.exit)(0);
    }

    async fn busy(&self, reply: Option<&str>, op: &'static str) {
        self.respond_busy(reply, op, BUSY).await;
    }

    async fn respond_busy(&self, reply: Option<&str>, op: &'static str, marker: &str) {
        debug!(op, "operation already running");
        self.agent.metrics.inc_rpc_busy(op);
        self.respond(reply, op, marker).await;
    }

    async fn respond<T: Serialize + ?Sized>(&self, reply: Option<&str>, op: &str, value: &T) {
        let Some(subject) = reply else {
            debug!(op, "no reply subject, response dropped");
            return;
        };
        let bytes = match envelope::encode(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(op, error = %err, "failed to encode rpc response");
                return;
            }
        };
        if let Err(err) = self.transport.publish(subject, bytes).await {
            warn!(op, error = %err, "failed to publish rpc response");
        }
    }

    /// Publishes an unsolicited result on the agent's subject, named by the
    /// reply subject.
    async fn notify<T: Serialize>(&self, name: &str, value: &T) {
        let bytes = match envelope::encode(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(name, error = %err, "failed to encode rpc notification");
                return;
            }
        };
        if let Err(err) = self
            .transport
            .publish_request(self.agent.agent_id(), name, bytes)
            .await
        {
            warn!(name, error = %err, "failed to publish rpc notification");
        }
    }
}

fn service_result(result: Result<(), ServiceError>) -> ServiceActionResult {
    ServiceActionResult::from(result)
}

fn ok_or_text<E: std::fmt::Display>(result: Result<(), E>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(err) => err.to_string(),
    }
}

async fn download_text(client: &reqwest::Client, url: &str) -> Option<String> {
    let response = match client.get(url).timeout(CHOCO_DOWNLOAD_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(url, status = response.status().as_u16(), "download refused");
            return None;
        }
        Err(err) => {
            warn!(url, error = %err, "download failed");
            return None;
        }
    };
    response.text().await.ok()
}

fn reboot() {
    let launched = if cfg!(windows) {
        spawn_detached("shutdown.exe", &["/r", "/t", "5", "/f"])
    } else {
        spawn_detached("shutdown", &["-r", "now"])
    };
    if let Err(err) = launched {
        error!(error = %err, "failed to launch reboot");
    }
}
