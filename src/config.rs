use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub agent_id: String,
    #[serde(default)]
    pub agent_pk: i64,
    pub token: String,
    pub server: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub nats_url: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_program_dir")]
    pub program_dir: PathBuf,
    #[serde(default = "default_python_bin")]
    pub python_bin: PathBuf,
    #[serde(default = "default_rpc_max_in_flight")]
    pub rpc_max_in_flight: usize,
    #[serde(default = "default_public_ip_urls")]
    pub public_ip_urls: Vec<String>,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChecksConfig {
    #[serde(default = "default_check_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
    #[serde(default = "default_cpu_sample_secs")]
    pub cpu_sample_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_eventlog_timeout_secs")]
    pub eventlog_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckinConfig {
    #[serde(default = "default_checkin_min_secs")]
    pub min_secs: u64,
    #[serde(default = "default_checkin_max_secs")]
    pub max_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_salt_service")]
    pub salt_service: String,
    #[serde(default = "default_salt_cache_dir")]
    pub salt_cache_dir: PathBuf,
    #[serde(default = "default_mesh_service")]
    pub mesh_service: String,
    #[serde(default)]
    pub mesh_exe: Option<PathBuf>,
    #[serde(default = "default_agent_service")]
    pub agent_service: String,
    #[serde(default = "default_rpc_service")]
    pub rpc_service: String,
    #[serde(default = "default_checkrunner_service")]
    pub checkrunner_service: String,
    #[serde(default = "default_service_poll_secs")]
    pub service_poll_secs: u64,
    #[serde(default = "default_service_wait_retries")]
    pub service_wait_retries: u32,
    /// Services served by this process, filled in from the run mode.
    #[serde(skip)]
    pub hosted_services: Vec<String>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_check_interval_secs(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
            cpu_sample_secs: default_cpu_sample_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            eventlog_timeout_secs: default_eventlog_timeout_secs(),
        }
    }
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            min_secs: default_checkin_min_secs(),
            max_secs: default_checkin_max_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            salt_service: default_salt_service(),
            salt_cache_dir: default_salt_cache_dir(),
            mesh_service: default_mesh_service(),
            mesh_exe: None,
            agent_service: default_agent_service(),
            rpc_service: default_rpc_service(),
            checkrunner_service: default_checkrunner_service(),
            service_poll_secs: default_service_poll_secs(),
            service_wait_retries: default_service_wait_retries(),
            hosted_services: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле agent_id обязательно".to_string(),
            ));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Validation("поле token обязательно".to_string()));
        }
        if !(self.server.starts_with("http://") || self.server.starts_with("https://")) {
            return Err(ConfigError::Validation(
                "поле server должно начинаться с http:// или https://".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.rpc_max_in_flight < 1 {
            return Err(ConfigError::Validation(
                "rpc_max_in_flight должно быть >= 1".to_string(),
            ));
        }

        validate_checks(&self.checks)?;
        validate_checkin(&self.checkin)?;
        validate_recovery(&self.recovery)?;

        Ok(())
    }

    /// Base URL for controller API calls, e.g. `https://rmm.example.com/api/v3`.
    pub fn api_base(&self) -> String {
        format!(
            "{}/{}",
            self.server.trim_end_matches('/'),
            self.api_prefix.trim_matches('/')
        )
    }

    /// Explicit `nats_url`, or `tls://<server host>:4222`.
    pub fn nats_url(&self) -> String {
        if let Some(url) = self.nats_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return url.to_string();
        }
        let host = self
            .server
            .split("://")
            .nth(1)
            .unwrap_or(&self.server)
            .split(['/', ':'])
            .next()
            .unwrap_or_default();
        format!("tls://{host}:4222")
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../agent.yaml.example")
    }
}

impl ChecksConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }
}

fn validate_checks(cfg: &ChecksConfig) -> Result<(), ConfigError> {
    if cfg.default_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "checks.default_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.jitter_min_secs > cfg.jitter_max_secs {
        return Err(ConfigError::Validation(
            "checks.jitter_min_secs не может быть больше jitter_max_secs".to_string(),
        ));
    }
    if cfg.cpu_sample_secs < 1 {
        return Err(ConfigError::Validation(
            "checks.cpu_sample_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_checkin(cfg: &CheckinConfig) -> Result<(), ConfigError> {
    if cfg.min_secs < 1 {
        return Err(ConfigError::Validation(
            "checkin.min_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.min_secs > cfg.max_secs {
        return Err(ConfigError::Validation(
            "checkin.min_secs не может быть больше checkin.max_secs".to_string(),
        ));
    }
    Ok(())
}

fn validate_recovery(cfg: &RecoveryConfig) -> Result<(), ConfigError> {
    let services = [
        ("salt_service", &cfg.salt_service),
        ("mesh_service", &cfg.mesh_service),
        ("agent_service", &cfg.agent_service),
        ("rpc_service", &cfg.rpc_service),
        ("checkrunner_service", &cfg.checkrunner_service),
    ];
    for (field, name) in services {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "recovery.{field} не должен быть пустым"
            )));
        }
    }
    if cfg.service_wait_retries < 1 {
        return Err(ConfigError::Validation(
            "recovery.service_wait_retries должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_api_prefix() -> String {
    "/api/v3".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_program_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\TacticalAgent")
    } else {
        PathBuf::from("/opt/rmmagent")
    }
}

fn default_python_bin() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\salt\bin\python.exe")
    } else {
        PathBuf::from("python3")
    }
}

const fn default_rpc_max_in_flight() -> usize {
    64
}

fn default_public_ip_urls() -> Vec<String> {
    vec![
        "https://icanhazip.tacticalrmm.io/".to_string(),
        "https://icanhazip.com".to_string(),
        "https://ifconfig.co/ip".to_string(),
    ]
}

const fn default_check_interval_secs() -> u64 {
    120
}

const fn default_jitter_min_secs() -> u64 {
    15
}

const fn default_jitter_max_secs() -> u64 {
    45
}

const fn default_cpu_sample_secs() -> u64 {
    10
}

const fn default_ping_timeout_secs() -> u64 {
    90
}

const fn default_eventlog_timeout_secs() -> u64 {
    180
}

const fn default_checkin_min_secs() -> u64 {
    30
}

const fn default_checkin_max_secs() -> u64 {
    90
}

fn default_salt_service() -> String {
    "salt-minion".to_string()
}

fn default_salt_cache_dir() -> PathBuf {
    PathBuf::from(r"C:\salt\var\cache\salt\minion")
}

fn default_mesh_service() -> String {
    "mesh agent".to_string()
}

fn default_agent_service() -> String {
    "tacticalagent".to_string()
}

fn default_rpc_service() -> String {
    "tacticalrpc".to_string()
}

fn default_checkrunner_service() -> String {
    "checkrunner".to_string()
}

const fn default_service_poll_secs() -> u64 {
    5
}

const fn default_service_wait_retries() -> u32 {
    10
}
