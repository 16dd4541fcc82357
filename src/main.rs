use clap::Parser;
use home_bridge_daemon::config::{Config, Paths, load_dotenv};
use home_bridge_daemon::control::{ControlServer, ControlSocketError};
use home_bridge_daemon::daemon::Daemon;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "home-bridge-daemon")]
#[command(about = "Supervises the home platform worker and serves cached state to local clients")]
struct Cli {
    /// Directory holding config.json, cache.json, the event log and sockets
    #[arg(long, env = "HOME_BRIDGE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Worker executable to launch and supervise
    #[arg(long, env = "HOME_BRIDGE_WORKER_BINARY")]
    worker_binary: Option<PathBuf>,

    /// Serve the cache and event log without supervising a worker
    #[arg(long, env = "HOME_BRIDGE_NO_MONITOR")]
    no_monitor: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let dotenv_path = Path::new(".env");
    let dotenv = load_dotenv(dotenv_path);
    init_logger();
    match dotenv {
        Ok(report) => report.log(dotenv_path),
        Err(e) => warn!("Failed to read {:?}: {}", dotenv_path, e),
    }
    let cli = Cli::parse();
    info!("Starting home bridge daemon");

    let paths = cli
        .config_dir
        .map(Paths::new)
        .unwrap_or_else(Paths::default_location);
    let mut config = Config::load(&paths.config_file());
    config.apply_env();
    if let Some(binary) = cli.worker_binary {
        config.supervisor.worker_binary = Some(binary);
    }
    info!("Configuration loaded:");
    info!("  Config dir: {:?}", paths.dir());
    info!("  Worker binary: {:?}", config.supervisor.worker_binary);
    info!("  Webhook: {}", if config.webhook.active_url().is_some() { "enabled" } else { "disabled" });
    info!("  Triggers: {}", config.triggers.len());
    info!("  Event log: {}", if config.event_log.enabled { "enabled" } else { "disabled" });

    let server = match ControlServer::bind(&paths.control_socket()) {
        Ok(server) => server,
        Err(ControlSocketError::AlreadyRunning) => {
            error!("Another home bridge daemon is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let daemon = Arc::new(Daemon::new(paths, config));
    if cli.no_monitor {
        info!("Worker supervision disabled");
    } else {
        daemon.start();
    }

    let cancel = CancellationToken::new();
    let control_task = tokio::spawn({
        let daemon = daemon.clone();
        let cancel = cancel.clone();
        async move { server.serve(daemon, cancel).await }
    });

    info!("Home bridge daemon is running");
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    cancel.cancel();
    if let Err(e) = control_task.await {
        error!("Control socket task failed: {}", e);
    }
    daemon.shutdown().await;

    info!("Home bridge daemon stopped");
}
