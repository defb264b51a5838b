use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::runner::{ScriptRunner, EXIT_SUCCESS, EXIT_TIMED_OUT};

const SCAN_TIMEOUT: Duration = Duration::from_secs(60 * 30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const REBOOT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("windows update is only available on windows")]
    Unsupported,
    #[error("invalid update id {0:?}")]
    InvalidGuid(String),
    #[error("windows update helper timed out")]
    TimedOut,
    #[error("windows update helper failed with code {code}: {stderr}")]
    Helper { code: i32, stderr: String },
    #[error("unexpected windows update helper output: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinUpdate {
    pub guid: String,
    #[serde(default)]
    pub kb: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub downloaded: bool,
}

#[async_trait]
pub trait PatchManager: Send + Sync {
    async fn scan(&self) -> Result<Vec<WinUpdate>, PatchError>;
    /// Downloads and installs one update; `Ok(false)` when the installer ran
    /// but reported failure.
    async fn install(&self, guid: &str) -> Result<bool, PatchError>;
    async fn needs_reboot(&self) -> Result<bool, PatchError>;
}

/// Drives the Windows Update Agent COM API through PowerShell.
pub struct WuaPatchManager {
    runner: ScriptRunner,
}

const SCAN_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$session = New-Object -ComObject Microsoft.Update.Session
$searcher = $session.CreateUpdateSearcher()
$result = $searcher.Search("IsHidden=0 and Type='Software'")
$out = @()
foreach ($u in $result.Updates) {
    $kb = ''
    if ($u.KBArticleIDs.Count -gt 0) { $kb = 'KB' + $u.KBArticleIDs.Item(0) }
    $out += [pscustomobject]@{
        guid = [string]$u.Identity.UpdateID
        kb = $kb
        title = [string]$u.Title
        severity = [string]$u.MsrcSeverity
        installed = [bool]$u.IsInstalled
        downloaded = [bool]$u.IsDownloaded
    }
}
ConvertTo-Json -InputObject @($out) -Compress
"#;

const INSTALL_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$guid = $args[0]
$session = New-Object -ComObject Microsoft.Update.Session
$result = $session.CreateUpdateSearcher().Search("UpdateID='$guid'")
if ($result.Updates.Count -eq 0) { Write-Output 'notfound'; exit 0 }
$coll = New-Object -ComObject Microsoft.Update.UpdateColl
foreach ($u in $result.Updates) {
    if (-not $u.EulaAccepted) { $u.AcceptEula() }
    [void]$coll.Add($u)
}
$downloader = $session.CreateUpdateDownloader()
$downloader.Updates = $coll
[void]$downloader.Download()
$installer = $session.CreateUpdateInstaller()
$installer.Updates = $coll
$res = $installer.Install()
if ($res.ResultCode -eq 2 -or $res.ResultCode -eq 3) { Write-Output 'ok' } else { Write-Output 'failed' }
"#;

const REBOOT_SCRIPT: &str = "(New-Object -ComObject Microsoft.Update.SystemInfo).RebootRequired";

impl WuaPatchManager {
    pub fn new(runner: ScriptRunner) -> Self {
        Self { runner }
    }

    async fn powershell(&self, script: &str, args: &[String], timeout: Duration) -> Result<String, PatchError> {
        if !cfg!(windows) {
            return Err(PatchError::Unsupported);
        }
        let out = self.runner.run_script(script, "powershell", args, timeout).await;
        if out.retcode == EXIT_TIMED_OUT {
            return Err(PatchError::TimedOut);
        }
        if out.retcode != EXIT_SUCCESS {
            return Err(PatchError::Helper {
                code: out.retcode,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl PatchManager for WuaPatchManager {
    async fn scan(&self) -> Result<Vec<WinUpdate>, PatchError> {
        let raw = self.powershell(SCAN_SCRIPT, &[], SCAN_TIMEOUT).await?;
        parse_updates(&raw)
    }

    async fn install(&self, guid: &str) -> Result<bool, PatchError> {
        validate_guid(guid)?;
        let out = self
            .powershell(INSTALL_SCRIPT, &[guid.to_string()], INSTALL_TIMEOUT)
            .await?;
        Ok(out.trim() == "ok")
    }

    async fn needs_reboot(&self) -> Result<bool, PatchError> {
        if !cfg!(windows) {
            return Ok(Path::new("/var/run/reboot-required").exists());
        }
        let out = self.powershell(REBOOT_SCRIPT, &[], REBOOT_QUERY_TIMEOUT).await?;
        Ok(out.trim().eq_ignore_ascii_case("true"))
    }
}

/// Update ids are GUIDs; anything else never reaches the search query.
pub fn validate_guid(guid: &str) -> Result<(), PatchError> {
    let ok = !guid.is_empty()
        && guid.len() <= 64
        && guid.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PatchError::InvalidGuid(guid.to_string()))
    }
}

fn parse_updates(raw: &str) -> Result<Vec<WinUpdate>, PatchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_validation() {
        assert!(validate_guid("0a1b2c3d-4e5f-6789-abcd-ef0123456789").is_ok());
        assert!(validate_guid("x' or 1=1").is_err());
        assert!(validate_guid("").is_err());
    }

    #[test]
    fn parses_scan_output() {
        let raw = r#"[{"guid":"0a1b2c3d-4e5f-6789-abcd-ef0123456789","kb":"KB5034441",
            "title":"2024-01 Security Update","severity":"Important","installed":false,"downloaded":true}]"#;
        let updates = parse_updates(raw).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kb, "KB5034441");
        assert!(updates[0].downloaded);
        assert!(parse_updates("").unwrap().is_empty());
    }
}
