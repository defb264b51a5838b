mod agent;
mod api;
mod checkin;
mod checks;
mod config;
mod host;
mod http;
mod metrics;
mod patches;
mod recovery;
mod rpc;
mod runner;
mod scheduler;
mod serde_util;
mod services;
mod state;
mod tasks;
mod update;

#[cfg(test)]
mod testing;

use agent::{Agent, VERSION};
use axum::serve;
use checkin::Checkin;
use checks::CheckEngine;
use clap::{Parser, ValueEnum};
use config::{Config, RecoveryConfig};
use metrics::Metrics;
use rpc::guard::Flights;
use rpc::{process_exit, Dispatcher, NatsTransport};
use state::{now_unix, State};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Check-in, checks and RPC in one process.
    Agent,
    Rpc,
    Checkrunner,
    Checkin,
    /// One check pass, then exit.
    Runchecks,
    /// Run the task given by --task, then exit.
    Taskrunner,
}

impl Mode {
    /// Services whose process this one is. Recovering one of them has to
    /// happen outside this process.
    fn hosted_services(self, recovery: &RecoveryConfig) -> Vec<String> {
        match self {
            Mode::Agent => vec![
                recovery.agent_service.clone(),
                recovery.rpc_service.clone(),
                recovery.checkrunner_service.clone(),
            ],
            Mode::Rpc => vec![recovery.rpc_service.clone()],
            Mode::Checkrunner => vec![recovery.checkrunner_service.clone()],
            Mode::Checkin => vec![recovery.agent_service.clone()],
            Mode::Runchecks | Mode::Taskrunner => Vec::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rmmagent")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./agent.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, value_enum, default_value_t = Mode::Agent)]
    mode: Mode,
    #[arg(long, required_if_eq("mode", "taskrunner"))]
    task: Option<i64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info");
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.log_level);
    cfg.recovery.hosted_services = cli.mode.hosted_services(&cfg.recovery);

    info!(
        agent_id = %cfg.agent_id,
        mode = ?cli.mode,
        version = VERSION,
        "запуск агента"
    );

    let shared_state = Arc::new(RwLock::new(
        State::new(now_unix()).with_identity(&cfg.agent_id, VERSION),
    ));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let listen = cfg.listen.clone();
    let agent = match Agent::from_config(cfg, metrics.clone(), shared_state.clone()) {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать агента");
            std::process::exit(1);
        }
    };

    match cli.mode {
        Mode::Runchecks => {
            let engine = CheckEngine::new(agent);
            if let Some(guard) = engine.try_begin_pass() {
                engine.run_pass(guard).await;
            }
            return;
        }
        Mode::Taskrunner => {
            let task_id = cli.task.unwrap_or_default();
            if let Err(err) = tasks::run_task(&agent, task_id).await {
                error!(task_id, error = %err, "задача не выполнена");
                std::process::exit(1);
            }
            return;
        }
        _ => {}
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flights = Arc::new(Flights::new());
    let engine = CheckEngine::new(agent.clone());
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let guards = http::Guards {
        checks: engine.clone(),
        flights: flights.clone(),
    };
    handles.push(spawn_http(
        &listen,
        metrics,
        shared_state,
        guards,
        shutdown_rx.clone(),
    ));

    if matches!(cli.mode, Mode::Agent | Mode::Checkin) {
        let checkin = Checkin::new(agent.clone(), flights.clone());
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { checkin.run_loop(shutdown).await }));
    }

    if matches!(cli.mode, Mode::Agent | Mode::Checkrunner) {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { engine.run_loop(shutdown).await }));
    }

    if matches!(cli.mode, Mode::Agent | Mode::Rpc) {
        let url = agent.config.nats_url();
        let transport = match NatsTransport::connect(
            &url,
            agent.agent_id(),
            &agent.config.token,
            agent.state.clone(),
        )
        .await
        {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                error!(error = %err, "не удалось подключиться к шине RPC");
                std::process::exit(1);
            }
        };
        let inbound = match transport.subscribe(agent.agent_id()).await {
            Ok(inbound) => inbound,
            Err(err) => {
                error!(error = %err, "не удалось подписаться на канал агента");
                std::process::exit(1);
            }
        };
        let dispatcher = Dispatcher::new(
            agent.clone(),
            transport,
            engine.clone(),
            flights.clone(),
            process_exit(),
        );
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run(inbound, shutdown).await
        }));
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}

fn spawn_http(
    listen: &str,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
    guards: http::Guards,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let listen = listen.to_string();
    tokio::spawn(async move {
        let app = http::build_router(metrics, state, guards);
        let addr: SocketAddr = match listen.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(error = %err, listen = %listen, "некорректный адрес listen");
                return;
            }
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!(error = %err, listen = %listen, "не удалось запустить HTTP-сервер");
                return;
            }
        };

        let server = serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

        if let Err(err) = server.await {
            error!(error = %err, "ошибка HTTP-сервера");
        }
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
