use crate::checks::CheckEngine;
use crate::metrics::Metrics;
use crate::rpc::guard::Flights;
use crate::state::State as AgentState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
    pub guards: Guards,
}

/// The exclusive operations whose progress `/api/state` reports.
#[derive(Clone)]
pub struct Guards {
    pub checks: CheckEngine,
    pub flights: Arc<Flights>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct GuardState {
    pub checks_running: bool,
    pub agent_update: bool,
    pub win_update_scan: bool,
    pub win_update_install: bool,
}

impl Guards {
    fn snapshot(&self) -> GuardState {
        GuardState {
            checks_running: self.checks.is_running(),
            agent_update: self.flights.agent_update.is_held(),
            win_update_scan: self.flights.win_update_scan.is_held(),
            win_update_install: self.flights.win_update_install.is_held(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub agent_id: String,
    pub version: String,
    pub started_at: String,
    pub uptime_seconds: i64,
    pub last_check_pass: Option<String>,
    pub check_interval_secs: u64,
    pub checks_last_pass: usize,
    pub failing_last_pass: usize,
    pub check_passes_total: u64,
    pub last_checkin: Option<String>,
    pub rpc_connected: bool,
    pub rpc_in_flight: i64,
    pub guards: GuardState,
}

impl ApiState {
    fn build(value: &AgentState, now: i64, rpc_in_flight: i64, guards: GuardState) -> Self {
        Self {
            agent_id: value.agent_id.clone(),
            version: value.version.clone(),
            started_at: rfc3339(value.started_at_unix),
            uptime_seconds: now.saturating_sub(value.started_at_unix),
            last_check_pass: value.last_check_pass_unix.map(rfc3339),
            check_interval_secs: value.check_interval_secs,
            checks_last_pass: value.checks_last_pass,
            failing_last_pass: value.failing_last_pass,
            check_passes_total: value.check_passes_total,
            last_checkin: value.last_checkin_unix.map(rfc3339),
            rpc_connected: value.rpc_connected,
            rpc_in_flight,
            guards,
        }
    }
}

fn rfc3339(unix: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<AgentState>>,
    guards: Guards,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            guards,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.update_from_state(&*state.state.read().await);
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let in_flight = state.metrics.agent_rpc_in_flight.get();
    let guards = state.guards.snapshot();
    let snapshot = state.state.read().await;
    Json(ApiState::build(&snapshot, crate::state::now_unix(), in_flight, guards))
}
