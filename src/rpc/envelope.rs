use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::SchedTask;
use crate::serde_util::nullable;
use crate::update::UpdateRequest;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),
    #[error("unknown operation {0:?}")]
    UnknownOp(String),
    #[error("invalid {field} for {op}: {reason}")]
    InvalidField {
        op: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// The msgpack map as it travels over the bus. Every field is optional on
/// the wire; [`Request`] is the validated form.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WireEnvelope {
    #[serde(default, deserialize_with = "nullable")]
    pub func: String,
    #[serde(default, deserialize_with = "nullable")]
    pub timeout: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub payload: HashMap<String, String>,
    #[serde(default, deserialize_with = "nullable")]
    pub script_args: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub procpid: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub taskpk: i64,
    #[serde(rename = "schedtaskpayload", default, deserialize_with = "nullable")]
    pub sched_task: SchedTask,
    #[serde(default, deserialize_with = "nullable")]
    pub recoverycommand: String,
    #[serde(default, deserialize_with = "nullable")]
    pub guids: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub choco_prog_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub choco_prog_ver: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    pub code: String,
    pub shell: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    KillProc { pid: u32 },
    RawCmd { shell: String, command: String, timeout: Duration },
    RunScript(ScriptRequest),
    RunScriptFull(ScriptRequest),
    Procs,
    WinServices,
    WinSvcDetail { name: String },
    WinSvcAction { name: String, action: String },
    EditWinSvc { name: String, start_type: String },
    EventLog { log_name: String, days: i64 },
    SchedTask(SchedTask),
    DelSchedTask { name: String },
    EnableSchedTask(SchedTask),
    ListSchedTasks,
    Recover { mode: String },
    RecoveryCmd { command: String },
    RebootNow,
    NeedsReboot,
    CpuLoadAvg,
    PublicIp,
    RunChecks,
    RunTask { task_id: i64 },
    InstallChoco,
    InstallWithChoco { name: String, version: String },
    GetWinUpdates,
    InstallWinUpdates { guids: Vec<String> },
    AgentUpdate(UpdateRequest),
    Uninstall,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::KillProc { .. } => "killproc",
            Request::RawCmd { .. } => "rawcmd",
            Request::RunScript(_) => "runscript",
            Request::RunScriptFull(_) => "runscriptfull",
            Request::Procs => "procs",
            Request::WinServices => "winservices",
            Request::WinSvcDetail { .. } => "winsvcdetail",
            Request::WinSvcAction { .. } => "winsvcaction",
            Request::EditWinSvc { .. } => "editwinsvc",
            Request::EventLog { .. } => "eventlog",
            Request::SchedTask(_) => "schedtask",
            Request::DelSchedTask { .. } => "delschedtask",
            Request::EnableSchedTask(_) => "enableschedtask",
            Request::ListSchedTasks => "listschedtasks",
            Request::Recover { .. } => "recover",
            Request::RecoveryCmd { .. } => "recoverycmd",
            Request::RebootNow => "rebootnow",
            Request::NeedsReboot => "needsreboot",
            Request::CpuLoadAvg => "cpuloadavg",
            Request::PublicIp => "publicip",
            Request::RunChecks => "runchecks",
            Request::RunTask { .. } => "runtask",
            Request::InstallChoco => "installchoco",
            Request::InstallWithChoco { .. } => "installwithchoco",
            Request::GetWinUpdates => "getwinupdates",
            Request::InstallWinUpdates { .. } => "installwinupdates",
            Request::AgentUpdate(_) => "agentupdate",
            Request::Uninstall => "uninstall",
        }
    }
}

impl TryFrom<WireEnvelope> for Request {
    type Error = DecodeError;

    fn try_from(mut wire: WireEnvelope) -> Result<Self, Self::Error> {
        let timeout = if wire.timeout > 0 {
            Duration::from_secs(wire.timeout as u64)
        } else {
            DEFAULT_RPC_TIMEOUT
        };
        let mut take = |key: &str| wire.payload.remove(key).unwrap_or_default();

        let request = match wire.func.as_str() {
            "ping" => Request::Ping,
            "killproc" => {
                let pid = u32::try_from(wire.procpid)
                    .ok()
                    .filter(|pid| *pid > 0)
                    .ok_or_else(|| DecodeError::InvalidField {
                        op: "killproc",
                        field: "procpid",
                        reason: format!("{} is not a process id", wire.procpid),
                    })?;
                Request::KillProc { pid }
            }
            "rawcmd" => Request::RawCmd {
                shell: take("shell"),
                command: take("command"),
                timeout,
            },
            func @ ("runscript" | "runscriptfull") => {
                let script = ScriptRequest {
                    code: take("code"),
                    shell: take("shell"),
                    args: std::mem::take(&mut wire.script_args),
                    timeout,
                };
                if func == "runscript" {
                    Request::RunScript(script)
                } else {
                    Request::RunScriptFull(script)
                }
            }
            "procs" => Request::Procs,
            "winservices" => Request::WinServices,
            "winsvcdetail" => Request::WinSvcDetail { name: take("name") },
            "winsvcaction" => Request::WinSvcAction {
                name: take("name"),
                action: take("action"),
            },
            "editwinsvc" => Request::EditWinSvc {
                name: take("name"),
                start_type: take("startType"),
            },
            "eventlog" => {
                let days = take("days");
                let days = days.trim().parse::<i64>().map_err(|err| DecodeError::InvalidField {
                    op: "eventlog",
                    field: "days",
                    reason: err.to_string(),
                })?;
                Request::EventLog {
                    log_name: take("logname"),
                    days,
                }
            }
            "schedtask" => Request::SchedTask(std::mem::take(&mut wire.sched_task)),
            "delschedtask" => Request::DelSchedTask {
                name: std::mem::take(&mut wire.sched_task.name),
            },
            "enableschedtask" => Request::EnableSchedTask(std::mem::take(&mut wire.sched_task)),
            "listschedtasks" => Request::ListSchedTasks,
            "recover" => Request::Recover { mode: take("mode") },
            "recoverycmd" => Request::RecoveryCmd {
                command: std::mem::take(&mut wire.recoverycommand),
            },
            "rebootnow" => Request::RebootNow,
            "needsreboot" => Request::NeedsReboot,
            "cpuloadavg" => Request::CpuLoadAvg,
            "publicip" => Request::PublicIp,
            "runchecks" => Request::RunChecks,
            "runtask" => Request::RunTask {
                task_id: wire.taskpk,
            },
            "installchoco" => Request::InstallChoco,
            "installwithchoco" => Request::InstallWithChoco {
                name: std::mem::take(&mut wire.choco_prog_name),
                version: std::mem::take(&mut wire.choco_prog_ver),
            },
            "getwinupdates" => Request::GetWinUpdates,
            "installwinupdates" => Request::InstallWinUpdates {
                guids: std::mem::take(&mut wire.guids),
            },
            "agentupdate" => Request::AgentUpdate(UpdateRequest {
                url: take("url"),
                inno: take("inno"),
                version: take("version"),
            }),
            "uninstall" => Request::Uninstall,
            other => return Err(DecodeError::UnknownOp(other.to_string())),
        };
        Ok(request)
    }
}

pub fn decode(bytes: &[u8]) -> Result<Request, DecodeError> {
    let wire: WireEnvelope = rmp_serde::from_slice(bytes)?;
    Request::try_from(wire)
}

/// Responses are msgpack maps keyed by field name.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(func: &str) -> WireEnvelope {
        WireEnvelope {
            func: func.to_string(),
            ..WireEnvelope::default()
        }
    }

    fn roundtrip(envelope: &WireEnvelope) -> Result<Request, DecodeError> {
        decode(&rmp_serde::to_vec_named(envelope).unwrap())
    }

    #[test]
    fn decodes_runscript() {
        let mut env = wire("runscript");
        env.timeout = 45;
        env.payload.insert("code".into(), "Get-Date".into());
        env.payload.insert("shell".into(), "powershell".into());
        env.script_args = vec!["-Verbose".into()];
        assert_eq!(
            roundtrip(&env).unwrap(),
            Request::RunScript(ScriptRequest {
                code: "Get-Date".into(),
                shell: "powershell".into(),
                args: vec!["-Verbose".into()],
                timeout: Duration::from_secs(45),
            })
        );
    }

    #[test]
    fn nil_fields_from_go_encoder_are_accepted() {
        #[derive(Serialize)]
        struct GoStyle<'a> {
            func: &'a str,
            timeout: i64,
            payload: Option<HashMap<String, String>>,
            script_args: Option<Vec<String>>,
            guids: Option<Vec<String>>,
        }
        let bytes = rmp_serde::to_vec_named(&GoStyle {
            func: "installwinupdates",
            timeout: 0,
            payload: None,
            script_args: None,
            guids: None,
        })
        .unwrap();
        assert_eq!(
            decode(&bytes).unwrap(),
            Request::InstallWinUpdates { guids: vec![] }
        );
    }

    #[test]
    fn extra_fields_are_ignored() {
        #[derive(Serialize)]
        struct Extended<'a> {
            func: &'a str,
            future_field: u8,
        }
        let bytes = rmp_serde::to_vec_named(&Extended {
            func: "ping",
            future_field: 1,
        })
        .unwrap();
        assert_eq!(decode(&bytes).unwrap(), Request::Ping);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(&[0xc1, 0x00, 0xff]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_op_is_reported() {
        assert!(matches!(
            roundtrip(&wire("softwarelist")),
            Err(DecodeError::UnknownOp(op)) if op == "softwarelist"
        ));
    }

    #[test]
    fn killproc_requires_positive_pid() {
        let mut env = wire("killproc");
        env.procpid = -4;
        assert!(matches!(
            roundtrip(&env),
            Err(DecodeError::InvalidField { field: "procpid", .. })
        ));
        env.procpid = 4242;
        assert_eq!(roundtrip(&env).unwrap(), Request::KillProc { pid: 4242 });
    }

    #[test]
    fn agentupdate_fields_come_from_payload() {
        let mut env = wire("agentupdate");
        env.payload.insert("url".into(), "https://dl.example.com/a.exe".into());
        env.payload.insert("inno".into(), "a.exe".into());
        env.payload.insert("version".into(), "1.5.0".into());
        let Request::AgentUpdate(update) = roundtrip(&env).unwrap() else {
            panic!("expected agentupdate");
        };
        assert_eq!(update.inno, "a.exe");
        assert_eq!(update.version, "1.5.0");
    }

    #[test]
    fn zero_timeout_uses_default() {
        let mut env = wire("rawcmd");
        env.payload.insert("command".into(), "whoami".into());
        let Request::RawCmd { timeout, command, .. } = roundtrip(&env).unwrap() else {
            panic!("expected rawcmd");
        };
        assert_eq!(timeout, DEFAULT_RPC_TIMEOUT);
        assert_eq!(command, "whoami");
    }
}
