use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::evaluators::evaluate;
use super::{Check, CheckType, FAILING};
use crate::agent::Agent;
use crate::rpc::guard::{FlightGuard, SingleFlight};
use crate::services::ServiceAction;
use crate::state::now_unix;
use crate::tasks;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub evaluated: usize,
    pub failing: usize,
}

#[derive(Clone)]
pub struct CheckEngine {
    agent: Arc<Agent>,
    running: Arc<SingleFlight>,
}

impl CheckEngine {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            running: SingleFlight::new("checks"),
        }
    }

    /// Reserves the engine for one pass; `None` while another pass runs.
    pub fn try_begin_pass(&self) -> Option<FlightGuard> {
        self.running.try_acquire()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_held()
    }

    /// Runs the scheduled loop until `shutdown` flips.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let default_interval = self.agent.config.checks.default_interval();
        let jitter = self.startup_jitter();
        info!(jitter_secs = jitter.as_secs(), "check loop starting");
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        loop {
            let interval = match self.try_begin_pass() {
                Some(guard) => self.run_pass(guard).await,
                None => {
                    debug!("out-of-band check pass in progress, skipping cycle");
                    None
                }
            };
            let sleep_for = next_sleep(interval, default_interval);
            self.agent.metrics.set_check_interval(sleep_for.as_secs());

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("check loop stopped");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// One full pass: fetch, evaluate everything concurrently, wait for all
    /// of it (including triggered tasks). Returns the controller's interval,
    /// or `None` when the fetch failed.
    pub async fn run_pass(&self, _guard: FlightGuard) -> Option<u64> {
        let list = match self.agent.controller.fetch_checks().await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "failed to fetch checks");
                self.agent.metrics.inc_check_fetch_error();
                return None;
            }
        };

        let mut pending = JoinSet::new();
        for check in list.checks {
            let Some(kind) = check.kind() else {
                debug!(check_id = check.id, check_type = %check.check_type, "skipping unknown check type");
                continue;
            };
            let agent = self.agent.clone();
            pending.spawn(async move { run_check(&agent, check, kind).await });
        }

        let mut summary = PassSummary::default();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Some(failing)) => {
                    summary.evaluated += 1;
                    if failing {
                        summary.failing += 1;
                    }
                }
                Ok(None) => {}
                Err(err) => error!(error = %err, "check task panicked"),
            }
        }

        self.agent.metrics.inc_check_pass();
        self.agent
            .state
            .write()
            .await
            .record_check_pass(now_unix(), list.check_interval, summary.evaluated, summary.failing);
        debug!(evaluated = summary.evaluated, failing = summary.failing, "check pass finished");
        Some(list.check_interval)
    }

    fn startup_jitter(&self) -> Duration {
        let checks = &self.agent.config.checks;
        let secs = if checks.jitter_max_secs > checks.jitter_min_secs {
            rand::thread_rng().gen_range(checks.jitter_min_secs..=checks.jitter_max_secs)
        } else {
            checks.jitter_min_secs
        };
        Duration::from_secs(secs)
    }
}

fn next_sleep(interval: Option<u64>, default_interval: Duration) -> Duration {
    interval
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default_interval)
}

/// Evaluates and reports one check. Returns whether the controller marked it
/// failing, or `None` when nothing was reported.
async fn run_check(agent: &Arc<Agent>, check: Check, kind: CheckType) -> Option<bool> {
    let metrics = &agent.metrics;
    let evaluation = evaluate(agent, &check, kind).await?;
    metrics.inc_check_evaluated(kind.as_str());
    if evaluation.timed_out {
        metrics.inc_script_timeout();
    }

    let verdict = agent
        .controller
        .report_check(&evaluation.payload, evaluation.report_timeout)
        .await;

    if let Some(service) = evaluation.restart_service.as_deref() {
        if let Err(err) = agent.services.control(service, ServiceAction::Start).await {
            warn!(check_id = check.id, service, error = %err, "failed to restart stopped service");
        }
    }

    let verdict = match verdict {
        Ok(verdict) => verdict,
        Err(err) => {
            debug!(check_id = check.id, error = %err, "failed to report check result");
            metrics.inc_check_report_error(kind.as_str());
            return None;
        }
    };

    let failing = verdict == FAILING;
    if failing {
        metrics.inc_check_failing(kind.as_str());
        run_assigned_tasks(agent, &check).await;
    }
    Some(failing)
}

async fn run_assigned_tasks(agent: &Arc<Agent>, check: &Check) {
    let mut running = JoinSet::new();
    for task_id in check.enabled_tasks() {
        let agent = agent.clone();
        running.spawn(async move {
            agent.metrics.inc_task_run();
            if let Err(err) = tasks::run_task(&agent, task_id).await {
                warn!(task_id, error = %err, "assigned task failed");
            }
        });
    }
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            error!(check_id = check.id, error = %err, "assigned task panicked");
        }
    }
}
