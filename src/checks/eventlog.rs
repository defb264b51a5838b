use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::runner::{ScriptRunner, EXIT_SUCCESS, EXIT_TIMED_OUT};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event logs are only available on windows")]
    Unsupported,
    #[error("event log name is empty")]
    EmptyName,
    #[error("event log helper timed out after {0} seconds")]
    TimedOut(u64),
    #[error("event log helper failed with code {code}: {stderr}")]
    Helper { code: i32, stderr: String },
    #[error("event log helper returned invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(default)]
    pub computer: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    #[serde(rename = "eventCategory", default)]
    pub event_category: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub record: String,
    #[serde(default)]
    pub uid: u64,
}

const HELPER: &str = r#"
$ErrorActionPreference = 'Stop'
$logName = $args[0]
$days = [int]$args[1]
$filter = @{ LogName = $logName }
if ($days -gt 0) { $filter.StartTime = (Get-Date).AddDays(-$days) }
$levels = @{ 0 = 'INFO'; 1 = 'ERROR'; 2 = 'ERROR'; 3 = 'WARNING'; 4 = 'INFO'; 5 = 'INFO' }
$uid = 0
$out = @()
try { $events = Get-WinEvent -FilterHashtable $filter } catch [Exception] {
    if ($_.FullyQualifiedErrorId -match 'NoMatchingEventsFound') { $events = @() } else { throw }
}
foreach ($ev in $events) {
    $uid++
    $type = $levels[[int]$ev.Level]
    if ($ev.Keywords -band 0x10000000000000) { $type = 'AUDIT_FAILURE' }
    elseif ($ev.Keywords -band 0x20000000000000) { $type = 'AUDIT_SUCCESS' }
    $out += [pscustomobject]@{
        computer = [string]$ev.MachineName
        source = [string]$ev.ProviderName
        eventType = [string]$type
        eventID = [string]$ev.Id
        eventCategory = [string]$ev.Task
        message = ([string]$ev.Message) -replace '[<>]', ''
        time = $ev.TimeCreated.ToString('yyyy-MM-dd HH:mm:ss')
        record = [string]$ev.RecordId
        uid = $uid
    }
}
ConvertTo-Json -InputObject @($out) -Compress -Depth 3
"#;

/// Reads entries of `log_name` newer than `days` days (0 means everything).
pub async fn read_event_log(
    runner: &ScriptRunner,
    log_name: &str,
    days: i64,
    timeout: Duration,
) -> Result<Vec<EventLogEntry>, EventLogError> {
    if !cfg!(windows) {
        return Err(EventLogError::Unsupported);
    }
    if log_name.trim().is_empty() {
        return Err(EventLogError::EmptyName);
    }
    let args = vec![log_name.to_string(), days.max(0).to_string()];
    let out = runner.run_script(HELPER, "powershell", &args, timeout).await;
    if out.retcode == EXIT_TIMED_OUT {
        return Err(EventLogError::TimedOut(timeout.as_secs()));
    }
    if out.retcode != EXIT_SUCCESS || !out.stderr.trim().is_empty() {
        return Err(EventLogError::Helper {
            code: out.retcode,
            stderr: out.stderr.trim().to_string(),
        });
    }
    parse_entries(&out.stdout)
}

pub fn parse_entries(raw: &str) -> Result<Vec<EventLogEntry>, EventLogError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.starts_with('{') {
        return Ok(vec![serde_json::from_str(raw)?]);
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helper_output() {
        let raw = r#"[{"computer":"WS01","source":"Service Control Manager","eventType":"ERROR",
            "eventID":"7000","eventCategory":"0","message":"The service failed","time":"2024-03-01 10:00:00",
            "record":"4411","uid":1}]"#;
        let entries = parse_entries(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_id, "7000");
        assert_eq!(entries[0].event_type, "ERROR");
    }

    #[test]
    fn empty_and_single_object_outputs() {
        assert!(parse_entries("  \n").unwrap().is_empty());
        let single = parse_entries(r#"{"computer":"WS01","uid":3}"#).unwrap();
        assert_eq!(single[0].uid, 3);
        assert!(parse_entries("not json").is_err());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn unsupported_off_windows() {
        let runner = ScriptRunner::new("python3");
        assert!(matches!(
            read_event_log(&runner, "System", 1, Duration::from_secs(5)).await,
            Err(EventLogError::Unsupported)
        ));
    }
}
