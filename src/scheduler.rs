//! Scheduled task registration through `schtasks.exe`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::runner::{run_command, RunnerError};
use crate::serde_util::nullable;

const SCHTASKS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduled tasks are only available on windows")]
    Unsupported,
    #[error("invalid scheduled task: {0}")]
    Invalid(String),
    #[error(transparent)]
    Command(#[from] RunnerError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SchedTask {
    #[serde(default, deserialize_with = "nullable")]
    pub pk: i64,
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub kind: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub trigger: String,
    #[serde(default, deserialize_with = "nullable")]
    pub enabled: bool,
    /// Bitmask, Sunday = 1 through Saturday = 64.
    #[serde(default, deserialize_with = "nullable")]
    pub weekdays: u16,
    #[serde(default, deserialize_with = "nullable")]
    pub year: i32,
    #[serde(default, deserialize_with = "nullable")]
    pub month: String,
    #[serde(default, deserialize_with = "nullable")]
    pub day: u32,
    #[serde(default, deserialize_with = "nullable")]
    pub hour: u32,
    #[serde(rename = "min", default, deserialize_with = "nullable")]
    pub minute: u32,
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn create(&self, task: &SchedTask) -> Result<(), SchedulerError>;
    async fn delete(&self, name: &str) -> Result<(), SchedulerError>;
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SchedulerError>;
    async fn list(&self) -> Result<Vec<String>, SchedulerError>;
}

pub struct SchtasksScheduler {
    agent_exe: PathBuf,
}

impl SchtasksScheduler {
    pub fn new(agent_exe: PathBuf) -> Self {
        Self { agent_exe }
    }

    async fn schtasks(&self, args: &[String]) -> Result<String, SchedulerError> {
        if !cfg!(windows) {
            return Err(SchedulerError::Unsupported);
        }
        let out = run_command("schtasks.exe", args, SCHTASKS_TIMEOUT)
            .await?
            .into_result("schtasks.exe", SCHTASKS_TIMEOUT)?;
        Ok(out.stdout)
    }
}

#[async_trait]
impl TaskScheduler for SchtasksScheduler {
    async fn create(&self, task: &SchedTask) -> Result<(), SchedulerError> {
        let args = create_args(task, &self.agent_exe.to_string_lossy())?;
        self.schtasks(&args).await?;
        if !task.enabled && task.kind == "rmm" {
            self.set_enabled(&task.name, false).await?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SchedulerError> {
        let args = strings(&["/Delete", "/TN", name, "/F"]);
        self.schtasks(&args).await.map(|_| ())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        let flag = if enabled { "/ENABLE" } else { "/DISABLE" };
        let args = strings(&["/Change", "/TN", name, flag]);
        self.schtasks(&args).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<String>, SchedulerError> {
        let args = strings(&["/Query", "/FO", "CSV", "/NH"]);
        let out = self.schtasks(&args).await?;
        Ok(parse_task_list(&out))
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn create_args(task: &SchedTask, agent_exe: &str) -> Result<Vec<String>, SchedulerError> {
    if task.name.trim().is_empty() {
        return Err(SchedulerError::Invalid("empty task name".to_string()));
    }
    let action = match task.kind.as_str() {
        "rmm" => format!("\"{agent_exe}\" --mode taskrunner --task {}", task.pk),
        "schedreboot" => "shutdown.exe /r /t 5 /f".to_string(),
        other => return Err(SchedulerError::Invalid(format!("unknown task type {other:?}"))),
    };

    let mut args = strings(&["/Create", "/F", "/RU", "SYSTEM", "/RL", "HIGHEST", "/TN"]);
    args.push(task.name.clone());
    args.push("/TR".to_string());
    args.push(action);

    let start_time = format!("{:02}:{:02}", task.hour, task.minute);
    match task.trigger.as_str() {
        "once" => {
            let date = format!(
                "{:02}/{:02}/{:04}",
                month_number(&task.month),
                task.day.max(1),
                task.year
            );
            args.extend(strings(&["/SC", "ONCE", "/SD", &date, "/ST", &start_time]));
        }
        "weekly" => {
            let days = weekday_names(task.weekdays);
            if days.is_empty() {
                return Err(SchedulerError::Invalid("weekly task without weekdays".to_string()));
            }
            args.extend(strings(&["/SC", "WEEKLY", "/D", &days.join(","), "/ST", &start_time]));
        }
        "manual" => {
            args.extend(strings(&["/SC", "ONCE", "/SD", "01/01/1975", "/ST", "01:00"]));
        }
        other => return Err(SchedulerError::Invalid(format!("unknown trigger {other:?}"))),
    }
    Ok(args)
}

fn month_number(name: &str) -> u32 {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
        .unwrap_or(1)
}

fn weekday_names(mask: u16) -> Vec<&'static str> {
    const DAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    DAYS.iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, day)| *day)
        .collect()
}

/// First CSV column of `schtasks /Query /FO CSV /NH`, without the leading `\`.
fn parse_task_list(csv: &str) -> Vec<String> {
    csv.lines()
        .filter_map(|line| line.strip_prefix('"'))
        .filter_map(|line| line.split('"').next())
        .map(|name| name.trim_start_matches('\\').to_string())
        .filter(|name| !name.is_empty() && name != "TaskName")
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(trigger: &str) -> SchedTask {
        SchedTask {
            pk: 42,
            kind: "rmm".to_string(),
            name: "TacticalRMM_cleanup".to_string(),
            trigger: trigger.to_string(),
            enabled: true,
            weekdays: 0b0010_0010,
            year: 2024,
            month: "March".to_string(),
            day: 7,
            hour: 3,
            minute: 5,
        }
    }

    #[test]
    fn weekly_task_arguments() {
        let args = create_args(&task("weekly"), "C:\\Agent\\rmmagent.exe").unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("/SC WEEKLY /D MON,FRI /ST 03:05"));
        assert!(joined.contains("--mode taskrunner --task 42"));
        assert!(joined.contains("/TN TacticalRMM_cleanup"));
    }

    #[test]
    fn once_task_uses_start_date() {
        let args = create_args(&task("once"), "agent.exe").unwrap();
        assert!(args.join(" ").contains("/SC ONCE /SD 03/07/2024 /ST 03:05"));
    }

    #[test]
    fn rejects_unknown_trigger_and_empty_weekdays() {
        assert!(create_args(&task("hourly"), "a").is_err());
        let mut weekly = task("weekly");
        weekly.weekdays = 0;
        assert!(create_args(&weekly, "a").is_err());
    }

    #[test]
    fn reboot_task_runs_shutdown() {
        let mut reboot = task("once");
        reboot.kind = "schedreboot".to_string();
        let args = create_args(&reboot, "a").unwrap();
        assert!(args.contains(&"shutdown.exe /r /t 5 /f".to_string()));
    }

    #[test]
    fn parses_csv_listing() {
        let csv = "\"\\TacticalRMM_a\",\"3/7/2024 3:05:00 AM\",\"Ready\"\r\n\
                   \"\\Microsoft\\Windows\\Defrag\\ScheduledDefrag\",\"N/A\",\"Ready\"\r\n\
                   \"\\TacticalRMM_a\",\"N/A\",\"Ready\"\r\n\
                   \r\n\
                   INFO: something\r\n";
        assert_eq!(
            parse_task_list(csv),
            vec![
                "Microsoft\\Windows\\Defrag\\ScheduledDefrag".to_string(),
                "TacticalRMM_a".to_string()
            ]
        );
    }

    #[test]
    fn month_lookup_defaults_to_january() {
        assert_eq!(month_number("December"), 12);
        assert_eq!(month_number("Smarch"), 1);
    }
}
