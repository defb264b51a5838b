//! OS service control.
//!
//! Windows goes through `sc.exe`/`net.exe`, everything else through
//! `systemctl`. Both backends parse the tools' text output into the same
//! [`ServiceInfo`] shape the controller expects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::runner::{run_command, spawn_detached, spawn_detached_shell, RunnerError};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::StartPending => "start_pending",
            ServiceStatus::StopPending => "stop_pending",
            ServiceStatus::Running => "running",
            ServiceStatus::ContinuePending => "continue_pending",
            ServiceStatus::PausePending => "pause_pending",
            ServiceStatus::Paused => "paused",
            ServiceStatus::Unknown => "unknown",
        }
    }

    /// Win32 `SERVICE_STATUS.dwCurrentState` values.
    pub fn from_win32(code: u32) -> Self {
        match code {
            1 => ServiceStatus::Stopped,
            2 => ServiceStatus::StartPending,
            3 => ServiceStatus::StopPending,
            4 => ServiceStatus::Running,
            5 => ServiceStatus::ContinuePending,
            6 => ServiceStatus::PausePending,
            7 => ServiceStatus::Paused,
            _ => ServiceStatus::Unknown,
        }
    }

    fn from_systemd(active_state: &str) -> Self {
        match active_state {
            "active" | "reloading" => ServiceStatus::Running,
            "activating" => ServiceStatus::StartPending,
            "deactivating" => ServiceStatus::StopPending,
            "inactive" | "failed" => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
    pub display_name: String,
    pub binpath: String,
    pub description: String,
    pub username: String,
    pub pid: u32,
    pub start_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl FromStr for ServiceAction {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(ServiceError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceActionResult {
    pub success: bool,
    pub errormsg: String,
}

impl<E: fmt::Display> From<Result<(), E>> for ServiceActionResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                errormsg: String::new(),
            },
            Err(err) => Self {
                success: false,
                errormsg: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0:?} does not exist")]
    NotFound(String),
    #[error("unknown service action {0:?}")]
    UnknownAction(String),
    #[error("unknown start type {0:?}")]
    UnknownStartType(String),
    #[error(transparent)]
    Command(#[from] RunnerError),
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn list(&self) -> Result<Vec<ServiceInfo>, ServiceError>;
    async fn detail(&self, name: &str) -> Result<ServiceInfo, ServiceError>;
    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError>;
    async fn control(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError>;
    /// `start_type` is one of `auto`, `autodelay`, `manual`, `disabled`.
    async fn set_start_type(&self, name: &str, start_type: &str) -> Result<(), ServiceError>;
    /// Restarts `name` from a detached process, for the service this process
    /// runs as. Returns once the restart is launched.
    async fn restart_detached(&self, name: &str) -> Result<(), ServiceError>;
}

pub fn platform_default() -> Arc<dyn ServiceManager> {
    if cfg!(windows) {
        Arc::new(ScServiceManager)
    } else {
        Arc::new(SystemdServiceManager)
    }
}

/// Polls until `name` reports `target`, giving up after `retries` misses.
pub async fn wait_for_status(
    services: &dyn ServiceManager,
    name: &str,
    target: ServiceStatus,
    retries: u32,
    poll: Duration,
) -> bool {
    for attempt in 1..=retries {
        match services.status(name).await {
            Ok(status) if status == target => return true,
            Ok(status) => debug!(service = name, %status, attempt, "waiting for service"),
            Err(err) => debug!(service = name, error = %err, attempt, "service status unavailable"),
        }
        if attempt < retries {
            tokio::time::sleep(poll).await;
        }
    }
    false
}

pub struct ScServiceManager;

const SC_DOES_NOT_EXIST: i32 = 1060;
const NET_ALREADY_STARTED: i32 = 2;

impl ScServiceManager {
    async fn sc(&self, name: &str, args: &[&str]) -> Result<String, ServiceError> {
        let out = run_command("sc.exe", args, QUERY_TIMEOUT).await?;
        if out.exit_code == SC_DOES_NOT_EXIST {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        Ok(out.into_result("sc.exe", QUERY_TIMEOUT)?.stdout)
    }

    async fn net(&self, verb: &str, name: &str) -> Result<(), ServiceError> {
        let out = run_command("net.exe", &[verb, name], CONTROL_TIMEOUT).await?;
        // net start on a running service exits 2; treat as done
        if verb == "start" && out.exit_code == NET_ALREADY_STARTED && out.stderr.contains("2182") {
            return Ok(());
        }
        out.into_result("net.exe", CONTROL_TIMEOUT)?;
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for ScServiceManager {
    async fn list(&self) -> Result<Vec<ServiceInfo>, ServiceError> {
        let out = self
            .sc("*", &["queryex", "type=", "service", "state=", "all"])
            .await?;
        Ok(parse_sc_query_blocks(&out))
    }

    async fn detail(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        let query = self.sc(name, &["queryex", name]).await?;
        let mut info = parse_sc_query_blocks(&query)
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        let config = self.sc(name, &["qc", name, "8192"]).await?;
        apply_sc_config(&mut info, &config);
        if let Ok(desc) = self.sc(name, &["qdescription", name, "8192"]).await {
            info.description = sc_fields(&desc).remove("DESCRIPTION").unwrap_or_default();
        }
        Ok(info)
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let out = self.sc(name, &["query", name]).await?;
        Ok(sc_fields(&out)
            .get("STATE")
            .map(|s| parse_sc_state(s))
            .unwrap_or(ServiceStatus::Unknown))
    }

    async fn control(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError> {
        match action {
            ServiceAction::Start => self.net("start", name).await,
            ServiceAction::Stop => self.net("stop", name).await,
            ServiceAction::Restart => {
                if let Err(err) = self.net("stop", name).await {
                    debug!(service = name, error = %err, "stop before restart failed");
                }
                self.net("start", name).await
            }
        }
    }

    async fn set_start_type(&self, name: &str, start_type: &str) -> Result<(), ServiceError> {
        let mode = match start_type {
            "auto" => "auto",
            "autodelay" => "delayed-auto",
            "manual" => "demand",
            "disabled" => "disabled",
            other => return Err(ServiceError::UnknownStartType(other.to_string())),
        };
        self.sc(name, &["config", name, "start=", mode]).await?;
        Ok(())
    }

    async fn restart_detached(&self, name: &str) -> Result<(), ServiceError> {
        if name.is_empty() || name.contains('"') {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        spawn_detached_shell(&format!("net stop \"{name}\" & net start \"{name}\""))?;
        Ok(())
    }
}

/// Splits `KEY : value` lines; continuation lines are ignored.
fn sc_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(' ') {
            continue;
        }
        fields
            .entry(key.to_string())
            .or_insert_with(|| value.trim().to_string());
    }
    fields
}

fn parse_sc_state(value: &str) -> ServiceStatus {
    value
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u32>().ok())
        .map(ServiceStatus::from_win32)
        .unwrap_or(ServiceStatus::Unknown)
}

fn parse_sc_query_blocks(text: &str) -> Vec<ServiceInfo> {
    let mut services = Vec::new();
    let mut current: Option<ServiceInfo> = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "SERVICE_NAME" => {
                if let Some(done) = current.take() {
                    services.push(done);
                }
                current = Some(ServiceInfo {
                    name: value.to_string(),
                    status: ServiceStatus::Unknown.to_string(),
                    ..ServiceInfo::default()
                });
            }
            "DISPLAY_NAME" => {
                if let Some(svc) = current.as_mut() {
                    svc.display_name = value.to_string();
                }
            }
            "STATE" => {
                if let Some(svc) = current.as_mut() {
                    svc.status = parse_sc_state(value).to_string();
                }
            }
            "PID" => {
                if let Some(svc) = current.as_mut() {
                    svc.pid = value.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    services.extend(current);
    services
}

fn apply_sc_config(info: &mut ServiceInfo, text: &str) {
    let fields = sc_fields(text);
    if let Some(path) = fields.get("BINARY_PATH_NAME") {
        info.binpath = path.clone();
    }
    if let Some(user) = fields.get("SERVICE_START_NAME") {
        info.username = user.clone();
    }
    if let Some(display) = fields.get("DISPLAY_NAME").filter(|d| !d.is_empty()) {
        info.display_name = display.clone();
    }
    if let Some(start) = fields.get("START_TYPE") {
        info.start_type = sc_start_type(start).to_string();
    }
}

fn sc_start_type(value: &str) -> &'static str {
    let delayed = value.contains("DELAYED");
    match value.split_whitespace().next() {
        Some("0") => "Boot",
        Some("1") => "System",
        Some("2") if delayed => "Automatic (Delayed)",
        Some("2") => "Automatic",
        Some("3") => "Manual",
        Some("4") => "Disabled",
        _ => "Unknown",
    }
}

pub struct SystemdServiceManager;

const SYSTEMD_PROPERTIES: &str =
    "--property=Id,Description,LoadState,ActiveState,MainPID,UnitFileState,ExecStart,User";

impl SystemdServiceManager {
    async fn show(&self, name: &str) -> Result<HashMap<String, String>, ServiceError> {
        let unit = unit_name(name);
        let out = run_command(
            "systemctl",
            &["show", unit.as_str(), "--no-pager", SYSTEMD_PROPERTIES],
            QUERY_TIMEOUT,
        )
        .await?
        .into_result("systemctl", QUERY_TIMEOUT)?;
        let props = parse_key_values(&out.stdout);
        if props.get("LoadState").map(String::as_str) == Some("not-found") {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        Ok(props)
    }

    async fn systemctl(&self, verb: &str, name: &str) -> Result<(), ServiceError> {
        let unit = unit_name(name);
        run_command("systemctl", &[verb, unit.as_str()], CONTROL_TIMEOUT)
            .await?
            .into_result("systemctl", CONTROL_TIMEOUT)?;
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn list(&self) -> Result<Vec<ServiceInfo>, ServiceError> {
        let out = run_command(
            "systemctl",
            &[
                "list-units",
                "--type=service",
                "--all",
                "--no-legend",
                "--plain",
                "--no-pager",
            ],
            QUERY_TIMEOUT,
        )
        .await?
        .into_result("systemctl", QUERY_TIMEOUT)?;
        Ok(parse_systemd_units(&out.stdout))
    }

    async fn detail(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        let props = self.show(name).await?;
        Ok(service_from_props(name, &props))
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let props = self.show(name).await?;
        Ok(props
            .get("ActiveState")
            .map(|s| ServiceStatus::from_systemd(s))
            .unwrap_or(ServiceStatus::Unknown))
    }

    async fn control(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError> {
        let verb = match action {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        };
        self.systemctl(verb, name).await
    }

    async fn set_start_type(&self, name: &str, start_type: &str) -> Result<(), ServiceError> {
        let verb = match start_type {
            "auto" | "autodelay" => "enable",
            "manual" | "disabled" => "disable",
            other => return Err(ServiceError::UnknownStartType(other.to_string())),
        };
        self.systemctl(verb, name).await
    }

    async fn restart_detached(&self, name: &str) -> Result<(), ServiceError> {
        let unit = unit_name(name);
        spawn_detached("systemctl", &["--no-block", "restart", unit.as_str()])?;
        Ok(())
    }
}

fn unit_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

fn parse_key_values(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn service_from_props(name: &str, props: &HashMap<String, String>) -> ServiceInfo {
    let get = |key: &str| props.get(key).cloned().unwrap_or_default();
    let status = props
        .get("ActiveState")
        .map(|s| ServiceStatus::from_systemd(s))
        .unwrap_or(ServiceStatus::Unknown);
    let start_type = match props.get("UnitFileState").map(String::as_str) {
        Some("enabled") | Some("enabled-runtime") => "Automatic",
        Some("static") | Some("indirect") => "Manual",
        Some("disabled") | Some("masked") => "Disabled",
        _ => "Unknown",
    };
    ServiceInfo {
        name: name.trim_end_matches(".service").to_string(),
        status: status.to_string(),
        display_name: get("Description"),
        binpath: exec_start_path(&get("ExecStart")),
        description: get("Description"),
        username: props
            .get("User")
            .filter(|u| !u.is_empty())
            .cloned()
            .unwrap_or_else(|| "root".to_string()),
        pid: get("MainPID").parse().unwrap_or(0),
        start_type: start_type.to_string(),
    }
}

/// `ExecStart={ path=/usr/sbin/cron ; argv[]=/usr/sbin/cron -f ; ... }`
fn exec_start_path(raw: &str) -> String {
    raw.split(';')
        .filter_map(|part| part.trim().trim_start_matches('{').trim().strip_prefix("path="))
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parse_systemd_units(text: &str) -> Vec<ServiceInfo> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start_matches('●').trim();
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            let _load = parts.next()?;
            let active = parts.next()?;
            let _sub = parts.next()?;
            let description = parts.collect::<Vec<_>>().join(" ");
            let name = unit.strip_suffix(".service")?;
            Some(ServiceInfo {
                name: name.to_string(),
                status: ServiceStatus::from_systemd(active).to_string(),
                display_name: description.clone(),
                description,
                ..ServiceInfo::default()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServices;

    const SC_QUERYEX: &str = "
SERVICE_NAME: Spooler
DISPLAY_NAME: Print Spooler
        TYPE               : 110  WIN32_OWN_PROCESS  (interactive)
        STATE              : 4  RUNNING
                                (STOPPABLE, NOT_PAUSABLE, IGNORES_SHUTDOWN)
        WIN32_EXIT_CODE    : 0  (0x0)
        PID                : 2236
        FLAGS              :

SERVICE_NAME: wuauserv
DISPLAY_NAME: Windows Update
        TYPE               : 20  WIN32_SHARE_PROCESS
        STATE              : 1  STOPPED
        PID                : 0
";

    const SC_QC: &str = "[SC] QueryServiceConfig SUCCESS

SERVICE_NAME: wuauserv
        TYPE               : 20  WIN32_SHARE_PROCESS
        START_TYPE         : 2   AUTO_START  (DELAYED)
        ERROR_CONTROL      : 1   NORMAL
        BINARY_PATH_NAME   : C:\\Windows\\system32\\svchost.exe -k netsvcs -p
        DISPLAY_NAME       : Windows Update
        SERVICE_START_NAME : LocalSystem
";

    #[test]
    fn parses_sc_queryex_blocks() {
        let services = parse_sc_query_blocks(SC_QUERYEX);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "Spooler");
        assert_eq!(services[0].display_name, "Print Spooler");
        assert_eq!(services[0].status, "running");
        assert_eq!(services[0].pid, 2236);
        assert_eq!(services[1].status, "stopped");
    }

    #[test]
    fn applies_sc_config() {
        let mut info = ServiceInfo::default();
        apply_sc_config(&mut info, SC_QC);
        assert_eq!(info.start_type, "Automatic (Delayed)");
        assert_eq!(info.username, "LocalSystem");
        assert_eq!(info.binpath, "C:\\Windows\\system32\\svchost.exe -k netsvcs -p");
        assert_eq!(info.display_name, "Windows Update");
    }

    #[test]
    fn win32_status_codes_map_to_text() {
        let expected = [
            (1, "stopped"),
            (2, "start_pending"),
            (3, "stop_pending"),
            (4, "running"),
            (5, "continue_pending"),
            (6, "pause_pending"),
            (7, "paused"),
            (42, "unknown"),
        ];
        for (code, text) in expected {
            assert_eq!(ServiceStatus::from_win32(code).as_str(), text);
        }
    }

    #[test]
    fn parses_systemd_show_output() {
        let props = parse_key_values(
            "Id=cron.service\nDescription=Regular background program processing daemon\n\
             LoadState=loaded\nActiveState=active\nMainPID=612\nUnitFileState=enabled\n\
             ExecStart={ path=/usr/sbin/cron ; argv[]=/usr/sbin/cron -f $EXTRA_OPTS ; ignore_errors=no }\nUser=\n",
        );
        let info = service_from_props("cron", &props);
        assert_eq!(info.status, "running");
        assert_eq!(info.pid, 612);
        assert_eq!(info.binpath, "/usr/sbin/cron");
        assert_eq!(info.start_type, "Automatic");
        assert_eq!(info.username, "root");
    }

    #[test]
    fn parses_systemd_unit_list() {
        let units = parse_systemd_units(
            "cron.service loaded active running Regular background program processing daemon\n\
             ● nginx.service loaded failed failed A high performance web server\n\
             dev-hugepages.mount loaded active mounted Huge Pages File System\n",
        );
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "cron");
        assert_eq!(units[0].status, "running");
        assert_eq!(units[1].name, "nginx");
        assert_eq!(units[1].status, "stopped");
    }

    #[test]
    fn action_parsing() {
        assert_eq!("restart".parse::<ServiceAction>().unwrap(), ServiceAction::Restart);
        assert!("pause".parse::<ServiceAction>().is_err());
    }

    #[tokio::test]
    async fn wait_for_status_gives_up_after_retries() {
        let services = FakeServices::new();
        services.set_status("spooler", ServiceStatus::Running);
        let reached = wait_for_status(
            services.as_ref(),
            "spooler",
            ServiceStatus::Stopped,
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(!reached);
        assert_eq!(services.status_queries("spooler"), 3);

        services.set_status("spooler", ServiceStatus::Stopped);
        assert!(
            wait_for_status(
                services.as_ref(),
                "spooler",
                ServiceStatus::Stopped,
                3,
                Duration::from_millis(1),
            )
            .await
        );
    }
}
