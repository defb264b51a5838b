use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of what the agent has been doing, served on `/api/state`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub agent_id: String,
    pub version: String,
    pub last_check_pass_unix: Option<i64>,
    pub check_interval_secs: u64,
    pub checks_last_pass: usize,
    pub failing_last_pass: usize,
    pub check_passes_total: u64,
    pub last_checkin_unix: Option<i64>,
    pub rpc_connected: bool,
}

impl State {
    pub fn new(started_at_unix: i64) -> Self {
        Self {
            started_at_unix,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, agent_id: &str, version: &str) -> Self {
        self.agent_id = agent_id.to_string();
        self.version = version.to_string();
        self
    }

    pub fn record_check_pass(&mut self, now: i64, interval_secs: u64, evaluated: usize, failing: usize) {
        self.last_check_pass_unix = Some(now);
        if interval_secs > 0 {
            self.check_interval_secs = interval_secs;
        }
        self.checks_last_pass = evaluated;
        self.failing_last_pass = failing;
        self.check_passes_total += 1;
    }

    pub fn record_checkin(&mut self, now: i64) {
        self.last_checkin_unix = Some(now);
    }

    pub fn set_rpc_connected(&mut self, connected: bool) {
        self.rpc_connected = connected;
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
