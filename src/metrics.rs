use crate::state::{now_unix, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub agent_uptime_seconds: Gauge,
    pub agent_check_passes_total: Counter,
    pub agent_check_fetch_errors_total: Counter,
    pub agent_check_evaluations_total: CounterVec,
    pub agent_check_report_errors_total: CounterVec,
    pub agent_check_failing_total: CounterVec,
    pub agent_check_interval_seconds: Gauge,
    pub agent_last_check_pass_timestamp_seconds: Gauge,
    pub agent_tasks_run_total: Counter,
    pub agent_scripts_timed_out_total: Counter,
    pub agent_rpc_requests_total: CounterVec,
    pub agent_rpc_busy_total: CounterVec,
    pub agent_rpc_decode_errors_total: Counter,
    pub agent_rpc_in_flight: IntGauge,
    pub agent_checkins_total: CounterVec,
    pub agent_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Seconds since the agent started"))?;
        let agent_check_passes_total = Counter::with_opts(opts!(
            "agent_check_passes_total",
            "Completed check passes"
        ))?;
        let agent_check_fetch_errors_total = Counter::with_opts(opts!(
            "agent_check_fetch_errors_total",
            "Failed check list fetches"
        ))?;
        let agent_check_evaluations_total = CounterVec::new(
            opts!("agent_check_evaluations_total", "Evaluated checks by type"),
            &["check_type"],
        )?;
        let agent_check_report_errors_total = CounterVec::new(
            opts!(
                "agent_check_report_errors_total",
                "Check results the controller did not accept, by type"
            ),
            &["check_type"],
        )?;
        let agent_check_failing_total = CounterVec::new(
            opts!("agent_check_failing_total", "Checks reported as failing, by type"),
            &["check_type"],
        )?;
        let agent_check_interval_seconds = Gauge::with_opts(opts!(
            "agent_check_interval_seconds",
            "Current sleep between check passes"
        ))?;
        let agent_last_check_pass_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_check_pass_timestamp_seconds",
            "Unix time of the last completed check pass"
        ))?;
        let agent_tasks_run_total = Counter::with_opts(opts!(
            "agent_tasks_run_total",
            "Remediation tasks started by failing checks"
        ))?;
        let agent_scripts_timed_out_total = Counter::with_opts(opts!(
            "agent_scripts_timed_out_total",
            "Scripts killed at their deadline"
        ))?;
        let agent_rpc_requests_total = CounterVec::new(
            opts!("agent_rpc_requests_total", "RPC requests by operation"),
            &["op"],
        )?;
        let agent_rpc_busy_total = CounterVec::new(
            opts!(
                "agent_rpc_busy_total",
                "RPC requests refused because the operation was already running"
            ),
            &["op"],
        )?;
        let agent_rpc_decode_errors_total = Counter::with_opts(opts!(
            "agent_rpc_decode_errors_total",
            "Inbound RPC messages that could not be decoded"
        ))?;
        let agent_rpc_in_flight =
            IntGauge::with_opts(opts!("agent_rpc_in_flight", "RPC handlers currently running"))?;
        let agent_checkins_total = CounterVec::new(
            opts!("agent_checkins_total", "Check-in attempts by result"),
            &["result"],
        )?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &agent_uptime_seconds)?;
        register(&registry, &agent_check_passes_total)?;
        register(&registry, &agent_check_fetch_errors_total)?;
        register(&registry, &agent_check_evaluations_total)?;
        register(&registry, &agent_check_report_errors_total)?;
        register(&registry, &agent_check_failing_total)?;
        register(&registry, &agent_check_interval_seconds)?;
        register(&registry, &agent_last_check_pass_timestamp_seconds)?;
        register(&registry, &agent_tasks_run_total)?;
        register(&registry, &agent_scripts_timed_out_total)?;
        register(&registry, &agent_rpc_requests_total)?;
        register(&registry, &agent_rpc_busy_total)?;
        register(&registry, &agent_rpc_decode_errors_total)?;
        register(&registry, &agent_rpc_in_flight)?;
        register(&registry, &agent_checkins_total)?;
        register(&registry, &agent_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            agent_uptime_seconds,
            agent_check_passes_total,
            agent_check_fetch_errors_total,
            agent_check_evaluations_total,
            agent_check_report_errors_total,
            agent_check_failing_total,
            agent_check_interval_seconds,
            agent_last_check_pass_timestamp_seconds,
            agent_tasks_run_total,
            agent_scripts_timed_out_total,
            agent_rpc_requests_total,
            agent_rpc_busy_total,
            agent_rpc_decode_errors_total,
            agent_rpc_in_flight,
            agent_checkins_total,
            agent_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.agent_uptime_seconds.set(uptime);
        if let Some(ts) = state.last_check_pass_unix {
            self.agent_last_check_pass_timestamp_seconds.set(ts as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn inc_check_pass(&self) {
        self.agent_check_passes_total.inc();
    }

    pub fn inc_check_fetch_error(&self) {
        self.agent_check_fetch_errors_total.inc();
    }

    pub fn inc_check_evaluated(&self, check_type: &str) {
        self.agent_check_evaluations_total
            .with_label_values(&[check_type])
            .inc();
    }

    pub fn inc_check_report_error(&self, check_type: &str) {
        self.agent_check_report_errors_total
            .with_label_values(&[check_type])
            .inc();
    }

    pub fn inc_check_failing(&self, check_type: &str) {
        self.agent_check_failing_total
            .with_label_values(&[check_type])
            .inc();
    }

    pub fn set_check_interval(&self, secs: u64) {
        self.agent_check_interval_seconds.set(secs as f64);
    }

    pub fn inc_task_run(&self) {
        self.agent_tasks_run_total.inc();
    }

    pub fn inc_script_timeout(&self) {
        self.agent_scripts_timed_out_total.inc();
    }

    pub fn inc_rpc_request(&self, op: &str) {
        self.agent_rpc_requests_total.with_label_values(&[op]).inc();
    }

    pub fn inc_rpc_busy(&self, op: &str) {
        self.agent_rpc_busy_total.with_label_values(&[op]).inc();
    }

    pub fn inc_rpc_decode_error(&self) {
        self.agent_rpc_decode_errors_total.inc();
    }

    pub fn inc_checkin(&self, result: &str) {
        self.agent_checkins_total.with_label_values(&[result]).inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_counters_show_up_after_use() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.inc_rpc_busy("agentupdate");
        metrics.inc_check_failing("diskspace");
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("agent_rpc_busy_total{op=\"agentupdate\"} 1"));
        assert!(text.contains("agent_check_failing_total{check_type=\"diskspace\"} 1"));
    }
}
