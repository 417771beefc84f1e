//! Node binary: parses the CLI, bootstraps a `Manager` from the configured
//! file, and keeps the process alive until `SIGINT` or `SIGHUP`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use clap::Parser;
use sensorflow_logging::{init_logging, AlertRecord, LogConfig};
use sensorflow_manager::Manager;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sensorflow", about = "Sensor-node dataflow runtime")]
struct Cli {
    /// Path to the node's configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the log file's directory (default: ~/.sensorflow/logs).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log verbosity, 1 (quietest) to 9 (loudest). 5 and above enables verbose output.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=9), default_value_t = 3)]
    verbosity: u8,

    /// Shorthand for maximum verbosity.
    #[arg(long)]
    debug: bool,

    /// Suppress all but error-level console output.
    #[arg(long)]
    quiet: bool,

    /// Accepted for CLI compatibility; an embedded broker is not implemented,
    /// point `core.intercom.mqtt` at an external broker instead.
    #[arg(long)]
    with_mqtt_broker: bool,

    /// Bind address for the local status HTTP server.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port for the local status HTTP server.
    #[arg(long, default_value_t = 8090)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(log_file) = &cli.log_file {
        if let Some(dir) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::env::set_var("SENSORFLOW_HOME", dir);
        }
    }

    let verbose = cli.debug || cli.verbosity >= 5;
    let logging_alert_rx = init_logging(LogConfig { app_name: "sensorflow", verbose, quiet: cli.quiet && !cli.debug })?;

    if cli.with_mqtt_broker {
        warn!("--with-mqtt-broker is accepted but no broker is embedded; point core.intercom.mqtt at an external broker");
    }

    // `tracing_subscriber` installs one global subscriber per process, so
    // the alert channel out of it can only be taken once. `SIGHUP` rebuilds
    // the `Manager` (and therefore its `Alerter`) from scratch, so this relay
    // sits between the fixed logging sender and whichever receiver the
    // current `Manager` owns, swapping the target on each restart.
    let (first_tx, first_rx) = mpsc::unbounded_channel::<AlertRecord>();
    let current_alert_tx = Arc::new(Mutex::new(first_tx));
    tokio::spawn(relay_alerts(logging_alert_rx, current_alert_tx.clone()));

    let manager = Manager::bootstrap(&cli.config, first_rx).await?;
    manager.start_all();
    info!(project = manager.project_id(), node = manager.node_id(), "node running");

    let manager = Arc::new(Mutex::new(manager));
    let http = spawn_status_server(manager.clone(), &cli.bind, cli.port);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                let mut guard = manager.lock().await;
                guard.stop_all();
                if tokio::time::timeout(Duration::from_secs(3), guard.shutdown(Duration::from_secs(3))).await.is_err() {
                    warn!("graceful shutdown exceeded deadline, killing remaining tasks");
                    guard.kill_all();
                }
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, restarting");
                let (tx, rx) = mpsc::unbounded_channel();
                *current_alert_tx.lock().await = tx;
                let mut guard = manager.lock().await;
                if let Err(err) = guard.restart(&cli.config, rx).await {
                    error!(error = %err, "restart failed, node is no longer running");
                    break;
                }
            }
        }
    }

    http.abort();
    Ok(())
}

async fn relay_alerts(mut source: mpsc::UnboundedReceiver<AlertRecord>, target: Arc<Mutex<mpsc::UnboundedSender<AlertRecord>>>) {
    while let Some(record) = source.recv().await {
        let tx = target.lock().await;
        let _ = tx.send(record);
    }
}

#[derive(Clone)]
struct HttpState {
    manager: Arc<Mutex<Manager>>,
}

#[derive(Deserialize)]
struct ServiceQuery {
    module: Option<String>,
    action: Option<String>,
}

fn spawn_status_server(manager: Arc<Mutex<Manager>>, bind: &str, port: u16) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = match format!("{bind}:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, bind, port, "invalid status HTTP bind address, server not started");
            return tokio::spawn(async {});
        }
    };

    let state = HttpState { manager };
    let app = axum::Router::new().route("/", get(status_handler)).with_state(state);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, %addr, "failed to bind status HTTP server");
                return;
            }
        };
        info!(%addr, "status HTTP server listening");
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "status HTTP server exited");
        }
    })
}

async fn status_handler(State(state): State<HttpState>, Query(query): Query<ServiceQuery>) -> Json<serde_json::Value> {
    let manager = state.manager.lock().await;

    match (query.module, query.action) {
        (Some(module), Some(action)) if action == "start" || action == "stop" => {
            let found = manager.send_service(&module, &action);
            Json(serde_json::json!({ "module": module, "action": action, "found": found }))
        }
        (Some(module), Some(action)) => Json(serde_json::json!({ "error": format!("unknown action \"{action}\"") , "module": module})),
        _ => Json(manager.status_snapshot()),
    }
}
