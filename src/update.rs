use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::runner::{spawn_detached, RunnerError};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid installer name {0:?}")]
    InvalidInstaller(String),
    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("uninstaller {0} not found")]
    UninstallerMissing(String),
    #[error(transparent)]
    Launch(#[from] RunnerError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub url: String,
    pub inno: String,
    pub version: String,
}

#[async_trait]
pub trait Updater: Send + Sync {
    /// Downloads the installer and launches it detached. Returns once the
    /// installer has started.
    async fn update(&self, request: &UpdateRequest) -> Result<(), UpdateError>;
    async fn uninstall(&self) -> Result<(), UpdateError>;
}

pub struct InstallerUpdater {
    client: Client,
    program_dir: PathBuf,
}

impl InstallerUpdater {
    pub fn new(client: Client, program_dir: PathBuf) -> Self {
        Self {
            client,
            program_dir,
        }
    }
}

#[async_trait]
impl Updater for InstallerUpdater {
    async fn update(&self, request: &UpdateRequest) -> Result<(), UpdateError> {
        validate_installer_name(&request.inno)?;
        let target = std::env::temp_dir().join(&request.inno);
        let path_text = target.display().to_string();

        let response = self
            .client
            .get(&request.url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|source| UpdateError::Download {
                url: request.url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(UpdateError::Status {
                url: request.url.clone(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|source| UpdateError::Download {
            url: request.url.clone(),
            source,
        })?;
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|source| UpdateError::Write {
                path: path_text.clone(),
                source,
            })?;
        make_executable(&target).map_err(|source| UpdateError::Write {
            path: path_text.clone(),
            source,
        })?;

        let pid = if cfg!(windows) {
            spawn_detached(&target, &["/VERYSILENT", "/SUPPRESSMSGBOXES"])?
        } else {
            spawn_detached(&target, &[] as &[&str])?
        };
        info!(version = %request.version, pid, installer = %path_text, "agent update started");
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), UpdateError> {
        let (uninstaller, args): (PathBuf, &[&str]) = if cfg!(windows) {
            (
                self.program_dir.join("unins000.exe"),
                &["/VERYSILENT", "/SUPPRESSMSGBOXES", "/FORCECLOSEAPPLICATIONS"],
            )
        } else {
            (self.program_dir.join("uninstall.sh"), &[])
        };
        if !uninstaller.exists() {
            return Err(UpdateError::UninstallerMissing(uninstaller.display().to_string()));
        }
        let pid = spawn_detached(&uninstaller, args)?;
        info!(pid, uninstaller = %uninstaller.display(), "uninstall started");
        Ok(())
    }
}

fn validate_installer_name(name: &str) -> Result<(), UpdateError> {
    let ok = !name.is_empty()
        && !name.contains(['/', '\\'])
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(UpdateError::InvalidInstaller(name.to_string()))
    }
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installer_name_must_be_plain_file() {
        assert!(validate_installer_name("winagent-v1.5.0.exe").is_ok());
        assert!(validate_installer_name("../evil.exe").is_err());
        assert!(validate_installer_name("C:\\x.exe").is_err());
        assert!(validate_installer_name("").is_err());
    }

    #[tokio::test]
    async fn uninstall_without_uninstaller_fails() {
        let dir = tempfile::tempdir().unwrap();
        let updater = InstallerUpdater::new(Client::new(), dir.path().to_path_buf());
        assert!(matches!(
            updater.uninstall().await,
            Err(UpdateError::UninstallerMissing(_))
        ));
    }
}
