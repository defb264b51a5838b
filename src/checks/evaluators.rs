use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::eventlog::read_event_log;
use super::{Check, CheckType};
use crate::agent::Agent;
use crate::host;
use crate::runner::{run_command, EXIT_TIMED_OUT};
use crate::services::{ServiceError, ServiceStatus};

const REPORT_TIMEOUT: Duration = Duration::from_secs(15);
const SLOW_REPORT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// What one evaluator produced for the controller.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub payload: Value,
    pub report_timeout: Duration,
    /// Service to start once the result has been reported.
    pub restart_service: Option<String>,
    pub timed_out: bool,
}

impl Evaluation {
    fn new(payload: Value) -> Self {
        Self {
            payload,
            report_timeout: REPORT_TIMEOUT,
            restart_service: None,
            timed_out: false,
        }
    }
}

/// `None` means the check was abandoned and nothing should be reported.
pub async fn evaluate(agent: &Agent, check: &Check, kind: CheckType) -> Option<Evaluation> {
    match kind {
        CheckType::DiskSpace => Some(disk_space(check).await),
        CheckType::CpuLoad => Some(cpu_load(agent, check).await),
        CheckType::Memory => Some(memory(check).await),
        CheckType::Ping => Some(ping(agent, check).await),
        CheckType::Script => Some(script(agent, check).await),
        CheckType::WinSvc => win_service(agent, check).await,
        CheckType::EventLog => event_log(agent, check).await,
    }
}

async fn disk_space(check: &Check) -> Evaluation {
    let disk = check.disk.clone();
    let usage = tokio::task::spawn_blocking(move || host::disk_usage(&disk))
        .await
        .ok()
        .flatten();
    let payload = match usage {
        Some(usage) => json!({
            "id": check.id,
            "exists": true,
            "percent_used": usage.percent,
            "total": usage.total,
            "free": usage.free,
        }),
        None => {
            debug!(check_id = check.id, disk = %check.disk, "disk not found");
            json!({ "id": check.id, "exists": false })
        }
    };
    Evaluation::new(payload)
}

async fn cpu_load(agent: &Agent, check: &Check) -> Evaluation {
    let window = Duration::from_secs(agent.config.checks.cpu_sample_secs);
    let percent = host::sample_cpu_percent(window).await;
    Evaluation::new(json!({ "id": check.id, "percent": percent.round() as i64 }))
}

async fn memory(check: &Check) -> Evaluation {
    let percent = tokio::task::spawn_blocking(host::memory_percent)
        .await
        .unwrap_or(0.0);
    Evaluation::new(json!({ "id": check.id, "percent": percent.round() as i64 }))
}

async fn ping(agent: &Agent, check: &Check) -> Evaluation {
    let timeout = Duration::from_secs(agent.config.checks.ping_timeout_secs);
    let args: Vec<&str> = if cfg!(windows) {
        vec![check.ip.as_str()]
    } else {
        vec!["-c", "4", check.ip.as_str()]
    };
    let (has_stdout, has_stderr, output) = match run_command("ping", &args, timeout).await {
        Ok(out) if out.timed_out => (false, true, format!("Ping check {} timed out", check.ip)),
        Ok(out) if out.exit_code != 0 || !out.stderr.is_empty() => {
            (false, true, format!("{}\n{}", out.stdout, out.stderr))
        }
        Ok(out) => (true, false, out.stdout),
        Err(err) => (false, true, err.to_string()),
    };
    Evaluation::new(json!({
        "id": check.id,
        "has_stdout": has_stdout,
        "has_stderr": has_stderr,
        "output": output,
    }))
}

async fn script(agent: &Agent, check: &Check) -> Evaluation {
    let timeout = if check.timeout > 0 {
        Duration::from_secs(check.timeout)
    } else {
        DEFAULT_SCRIPT_TIMEOUT
    };
    let out = agent
        .runner
        .run_script(&check.script.code, &check.script.shell, &check.script_args, timeout)
        .await;
    let mut evaluation = Evaluation::new(json!({
        "id": check.id,
        "stdout": out.stdout,
        "stderr": out.stderr,
        "retcode": out.retcode,
        "runtime": out.execution_time,
    }));
    evaluation.report_timeout = SLOW_REPORT_TIMEOUT;
    evaluation.timed_out = out.retcode == EXIT_TIMED_OUT;
    evaluation
}

async fn win_service(agent: &Agent, check: &Check) -> Option<Evaluation> {
    let (exists, status) = match agent.services.status(&check.svc_name).await {
        Ok(status) => (true, status),
        Err(ServiceError::NotFound(_)) => (false, ServiceStatus::Unknown),
        Err(err) => {
            debug!(check_id = check.id, service = %check.svc_name, error = %err, "service status failed");
            return None;
        }
    };
    let status_text = if exists { status.as_str() } else { "n/a" };
    let mut evaluation = Evaluation::new(json!({
        "id": check.id,
        "exists": exists,
        "status": status_text,
    }));
    if exists && check.restart_if_stopped && status == ServiceStatus::Stopped {
        evaluation.restart_service = Some(check.svc_name.clone());
    }
    Some(evaluation)
}

async fn event_log(agent: &Agent, check: &Check) -> Option<Evaluation> {
    let timeout = Duration::from_secs(agent.config.checks.eventlog_timeout_secs);
    let entries = match read_event_log(&agent.runner, &check.log_name, check.search_last_days, timeout).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(check_id = check.id, log = %check.log_name, error = %err, "event log check abandoned");
            return None;
        }
    };
    let log = serde_json::to_string(&entries).ok()?;
    let mut evaluation = Evaluation::new(json!({ "id": check.id, "log": log }));
    evaluation.report_timeout = SLOW_REPORT_TIMEOUT;
    Some(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_agent, FakeApi, FakeServices};

    fn check(kind: &str) -> Check {
        Check {
            id: 11,
            check_type: kind.to_string(),
            ..Check::default()
        }
    }

    #[tokio::test]
    async fn missing_disk_reports_not_exists() {
        let agent = test_agent(FakeApi::ok(""));
        let mut c = check("diskspace");
        c.disk = "Q:".to_string();
        let eval = evaluate(&agent, &c, CheckType::DiskSpace).await.unwrap();
        assert_eq!(eval.payload, json!({"id": 11, "exists": false}));
    }

    #[tokio::test]
    async fn missing_service_reports_na() {
        let agent = test_agent(FakeApi::ok(""));
        let mut c = check("winsvc");
        c.svc_name = "nope".to_string();
        let eval = evaluate(&agent, &c, CheckType::WinSvc).await.unwrap();
        assert_eq!(eval.payload["exists"], json!(false));
        assert_eq!(eval.payload["status"], json!("n/a"));
        assert!(eval.restart_service.is_none());
    }

    #[tokio::test]
    async fn stopped_service_requests_restart() {
        let services = FakeServices::new();
        services.set_status("spooler", ServiceStatus::Stopped);
        let agent = crate::testing::agent_with_services(FakeApi::ok(""), services);
        let mut c = check("winsvc");
        c.svc_name = "spooler".to_string();
        c.restart_if_stopped = true;
        let eval = evaluate(&agent, &c, CheckType::WinSvc).await.unwrap();
        assert_eq!(eval.payload["status"], json!("stopped"));
        assert_eq!(eval.restart_service.as_deref(), Some("spooler"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_check_payload_carries_retcode() {
        let agent = test_agent(FakeApi::ok(""));
        let mut c = check("script");
        c.script.shell = "shell".to_string();
        c.script.code = "echo warn 1>&2\nexit 2\n".to_string();
        c.timeout = 10;
        let eval = evaluate(&agent, &c, CheckType::Script).await.unwrap();
        assert_eq!(eval.payload["retcode"], json!(2));
        assert_eq!(eval.payload["stderr"].as_str().map(str::trim), Some("warn"));
        assert!(!eval.timed_out);
    }

    #[tokio::test]
    async fn memory_percent_is_integer() {
        let agent = test_agent(FakeApi::ok(""));
        let eval = evaluate(&agent, &check("memory"), CheckType::Memory).await.unwrap();
        let pct = eval.payload["percent"].as_i64().expect("integer percent");
        assert!((0..=100).contains(&pct));
    }
}
