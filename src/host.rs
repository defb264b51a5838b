use reqwest::Client;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use sysinfo::{CpuExt, DiskExt, PidExt, ProcessExt, System, SystemExt, UserExt};
use tracing::debug;

const MIN_CPU_WINDOW: Duration = Duration::from_millis(250);
const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub device: String,
    pub fstype: String,
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
    /// Resident memory as an SI string; the controller keeps the historic
    /// field name.
    #[serde(rename = "memory_percent")]
    pub memory: String,
    pub username: String,
    pub id: usize,
    pub cpu_percent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub hostname: String,
    pub operating_system: String,
    pub platform: String,
    pub total_ram: u64,
    pub boot_time: u64,
    pub disks: Vec<DiskUsage>,
}

pub fn list_disks() -> Vec<DiskUsage> {
    let mut system = System::new();
    system.refresh_disks_list();
    system
        .disks()
        .iter()
        .filter(|d| d.total_space() > 0)
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            let used = total.saturating_sub(free);
            DiskUsage {
                device: normalize_device(&d.mount_point().to_string_lossy()),
                fstype: String::from_utf8_lossy(d.file_system()).into_owned(),
                total,
                free,
                used,
                percent: percent(used, total),
            }
        })
        .collect()
}

/// Looks up a disk by drive letter (`C:`) or mount point (`/`).
pub fn disk_usage(device: &str) -> Option<DiskUsage> {
    let wanted = normalize_device(device);
    list_disks().into_iter().find(|d| d.device.eq_ignore_ascii_case(&wanted))
}

/// `C:\` and `c:` both become `C:`; unix mount points are left as they are.
fn normalize_device(raw: &str) -> String {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return format!("{}:", (bytes[0] as char).to_ascii_uppercase());
    }
    if trimmed.len() > 1 {
        trimmed.trim_end_matches('/').to_string()
    } else {
        trimmed.to_string()
    }
}

/// System-wide CPU usage averaged over `window`.
pub async fn sample_cpu_percent(window: Duration) -> f64 {
    let mut system = System::new();
    system.refresh_cpu();
    tokio::time::sleep(window.max(MIN_CPU_WINDOW)).await;
    system.refresh_cpu();
    system.global_cpu_info().cpu_usage() as f64
}

pub fn memory_percent() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    percent(system.used_memory(), system.total_memory())
}

/// Blocking: takes two process samples a short interval apart so CPU usage
/// is meaningful.
pub fn list_processes() -> Vec<ProcessEntry> {
    let mut system = System::new();
    system.refresh_users_list();
    system.refresh_processes();
    std::thread::sleep(MIN_CPU_WINDOW);
    system.refresh_processes();
    let cpus = system.cpus().len().max(1) as f32;

    let mut entries: Vec<ProcessEntry> = system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != 0)
        .map(|(pid, proc_)| {
            let username = proc_
                .user_id()
                .and_then(|uid| system.get_user_by_id(uid))
                .map(|u| u.name().to_string())
                .unwrap_or_default();
            ProcessEntry {
                name: proc_.name().to_string(),
                pid: pid.as_u32(),
                memory: byte_count_si(proc_.memory()),
                username,
                id: 0,
                cpu_percent: format!("{:.1}", proc_.cpu_usage() / cpus),
            }
        })
        .collect();
    entries.sort_by_key(|e| e.pid);
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.id = idx + 1;
    }
    entries
}

pub fn host_facts() -> HostFacts {
    let mut system = System::new();
    system.refresh_memory();
    HostFacts {
        hostname: system.host_name().unwrap_or_default(),
        operating_system: system.long_os_version().unwrap_or_default(),
        platform: std::env::consts::OS.to_string(),
        total_ram: system.total_memory(),
        boot_time: system.boot_time(),
        disks: list_disks(),
    }
}

/// Asks each endpoint in turn for this host's public address; `"error"` when
/// none answers with a valid IP.
pub async fn public_ip(client: &Client, urls: &[String]) -> String {
    for url in urls {
        let response = match client.get(url).timeout(PUBLIC_IP_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url = %url, status = r.status().as_u16(), "public ip endpoint refused");
                continue;
            }
            Err(err) => {
                debug!(url = %url, error = %err, "public ip endpoint unreachable");
                continue;
            }
        };
        if let Ok(body) = response.text().await {
            let candidate = body.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    "error".to_string()
}

/// Decimal (SI) byte count, e.g. `1.5 MB`.
pub fn byte_count_si(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_si_formats() {
        assert_eq!(byte_count_si(999), "999 B");
        assert_eq!(byte_count_si(1000), "1.0 kB");
        assert_eq!(byte_count_si(1_500_000), "1.5 MB");
        assert_eq!(byte_count_si(2_000_000_000), "2.0 GB");
    }

    #[test]
    fn device_names_normalize() {
        assert_eq!(normalize_device("c:\\"), "C:");
        assert_eq!(normalize_device("D:"), "D:");
        assert_eq!(normalize_device("/"), "/");
        assert_eq!(normalize_device("/mnt/data/"), "/mnt/data");
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[test]
    fn process_list_includes_self() {
        let own = std::process::id();
        let procs = list_processes();
        assert!(procs.iter().any(|p| p.pid == own));
        assert!(procs.iter().all(|p| p.id >= 1));
    }
}
