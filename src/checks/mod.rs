pub mod engine;
pub mod eventlog;
pub mod evaluators;

pub use engine::CheckEngine;

use serde::Deserialize;

use crate::runner::ScriptBody;
use crate::serde_util::nullable;

/// Status text the controller returns for a check that crossed its threshold.
pub const FAILING: &str = "failing";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckList {
    #[serde(default, deserialize_with = "nullable")]
    pub check_interval: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckType {
    DiskSpace,
    CpuLoad,
    Memory,
    Ping,
    Script,
    WinSvc,
    EventLog,
}

impl CheckType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "diskspace" => Some(CheckType::DiskSpace),
            "cpuload" => Some(CheckType::CpuLoad),
            "memory" => Some(CheckType::Memory),
            "ping" => Some(CheckType::Ping),
            "script" => Some(CheckType::Script),
            "winsvc" => Some(CheckType::WinSvc),
            "eventlog" => Some(CheckType::EventLog),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckType::DiskSpace => "diskspace",
            CheckType::CpuLoad => "cpuload",
            CheckType::Memory => "memory",
            CheckType::Ping => "ping",
            CheckType::Script => "script",
            CheckType::WinSvc => "winsvc",
            CheckType::EventLog => "eventlog",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignedTask {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Check {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub check_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub assigned_tasks: Vec<AssignedTask>,
    #[serde(default, deserialize_with = "nullable")]
    pub script: ScriptBody,
    #[serde(default, deserialize_with = "nullable")]
    pub script_args: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub timeout: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub disk: String,
    #[serde(default, deserialize_with = "nullable")]
    pub ip: String,
    #[serde(default, deserialize_with = "nullable")]
    pub svc_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub restart_if_stopped: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub log_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub search_last_days: i64,
}

impl Check {
    pub fn kind(&self) -> Option<CheckType> {
        CheckType::parse(&self.check_type)
    }

    pub fn enabled_tasks(&self) -> impl Iterator<Item = i64> + '_ {
        self.assigned_tasks
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_controller_check_list() {
        let raw = r#"{
            "agent": 3,
            "check_interval": 90,
            "checks": [
                {"id": 1, "check_type": "diskspace", "disk": "C:", "threshold": 25,
                 "assigned_tasks": [{"id": 7, "enabled": true}, {"id": 8, "enabled": false}]},
                {"id": 2, "check_type": "script", "script": {"shell": "powershell", "code": "exit 0"},
                 "script_args": null, "timeout": 30, "ip": null},
                {"id": 3, "check_type": "sqlserver"}
            ]
        }"#;
        let list: CheckList = serde_json::from_str(raw).expect("decode");
        assert_eq!(list.check_interval, 90);
        assert_eq!(list.checks.len(), 3);
        assert_eq!(list.checks[0].kind(), Some(CheckType::DiskSpace));
        assert_eq!(list.checks[0].enabled_tasks().collect::<Vec<_>>(), vec![7]);
        assert_eq!(list.checks[1].script.shell, "powershell");
        assert!(list.checks[1].script_args.is_empty());
        assert_eq!(list.checks[2].kind(), None);
    }
}
