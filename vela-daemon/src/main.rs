//! `vela-daemon`: reactive video orchestration for an interactive
//! installation (spec §1–§2).
//!
//! Startup sequencing mirrors the original `main.py::start_things`: acquire
//! the session bus, connect the bus-name tracker, bring up the Level
//! Orchestrator's per-level pool, then start the input adapters and the
//! control surface.

mod agd;
mod bus;
mod bus_daemon;
mod bus_name;
mod config;
mod control;
mod error;
mod event_bus;
mod inputs;
mod logging;
mod mpris;
mod orchestrator;
mod player;
mod process;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::agd::AgdDetector;
use crate::bus::Bus;
use crate::bus_daemon::BusDaemon;
use crate::bus_name::BusNameTracker;
use crate::config::{InputConfig, Settings};
use crate::control::ControlServer;
use crate::error::VelaError;
use crate::logging::LogController;
use crate::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "vela-daemon", about = "Reactive video orchestration daemon")]
struct Args {
    /// Path to the JSON settings file.
    #[arg(short, long, default_value = "settings.json")]
    config: PathBuf,

    /// Path to the Unix control socket.
    #[arg(long, default_value = "/tmp/vela.sock")]
    control_socket: PathBuf,

    /// AGD sliding-window capacity (number of retained positive derivatives).
    #[arg(long, default_value_t = 10)]
    agd_capacity: usize,

    /// AGD level thresholds, ordered and comma-separated (e.g. "10,20,30").
    #[arg(long, default_value = "10,20,30")]
    agd_thresholds: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (filter_layer, reload_handle) = tracing_subscriber::reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let log_controller = Arc::new(LogController::new(reload_handle, "warn".to_string()));

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(run(args, log_controller));
    std::process::exit(exit_code);
}

/// Returns a process exit code per spec §6: 0 normal, a negative value for
/// "subsystem N failed to start" during startup.
async fn run(args: Args, log_controller: Arc<LogController>) -> i32 {
    let base_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let settings = match Settings::load(&args.config, &base_dir) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "subsystem 1 (configuration) failed to start");
            return -1;
        }
    };

    if let Err(e) = log_controller
        .apply_initial(&settings.loglevel, &settings.loglevels)
        .await
    {
        error!(error = %e, "subsystem 1 (configuration) failed to start");
        return -1;
    }

    if let Some(path) = &settings.environment.ld_library_path {
        std::env::set_var("LD_LIBRARY_PATH", path);
    }

    let bus_daemon = match BusDaemon::acquire(&settings.environment.dbus_daemon_bin).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "subsystem 2 (bus daemon) failed to start");
            return -2;
        }
    };

    let connection = match zbus::connection::Builder::address(bus_daemon.address()) {
        Ok(builder) => match builder.build().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "subsystem 3 (bus connection) failed to start");
                return -3;
            }
        },
        Err(e) => {
            error!(error = %e, "subsystem 3 (bus connection) failed to start");
            return -3;
        }
    };

    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let disconnect_hook: Box<dyn FnOnce() + Send + 'static> = Box::new(move || {
        let _ = disconnect_tx.send(());
    });

    let tracker = match BusNameTracker::connect(&connection, disconnect_hook).await {
        Ok(tracker) => tracker,
        Err(e) => {
            error!(error = %e, "subsystem 4 (bus name tracker) failed to start");
            return -4;
        }
    };

    let bus = Arc::new(Bus::default());

    let orchestrator = match Orchestrator::start(&settings, bus.clone(), connection, tracker).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "subsystem 5 (level orchestrator) failed to start");
            return -5;
        }
    };

    let thresholds = parse_thresholds(&args.agd_thresholds);
    let agd = Arc::new(AgdDetector::new(args.agd_capacity, thresholds, "arduino", bus.clone()).await);

    let feed_agd = agd.clone();
    bus.arduino_reading
        .attach(move |reading: i64| {
            let feed_agd = feed_agd.clone();
            async move {
                feed_agd.feed(reading).await;
                Ok(())
            }
        })
        .await;

    spawn_adapters(&settings, bus.clone(), log_controller.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let control_server = ControlServer::new(orchestrator.clone(), agd, bus, log_controller, shutdown_tx);
    let control_socket = args.control_socket.clone();
    tokio::spawn(async move {
        if let Err(e) = control_server.run(&control_socket).await {
            error!(error = %e, "control server exited");
        }
    });

    info!("vela-daemon running");
    wait_for_shutdown(shutdown_rx, disconnect_rx).await;

    info!("shutting down");
    orchestrator.shutdown(bus_daemon).await;
    0
}

/// Waits for an operator-requested shutdown, a process signal, or the bus
/// disconnect hook firing (spec §4.3 B4 "triggers controlled shutdown").
async fn wait_for_shutdown(shutdown_rx: oneshot::Receiver<()>, disconnect_rx: oneshot::Receiver<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = shutdown_rx => {}
            _ = disconnect_rx => { error!("session bus disconnected; shutting down"); }
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = shutdown_rx => {}
            _ = disconnect_rx => { error!("session bus disconnected; shutting down"); }
            _ = tokio::signal::ctrl_c() => {}
        }
    }
}

fn parse_thresholds(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .collect()
}

fn spawn_adapters(settings: &Settings, bus: Arc<Bus>, log_controller: Arc<LogController>) {
    for input in &settings.inputs {
        match input {
            InputConfig::Serial { port, baud } => {
                let port = port.clone();
                let baud = *baud;
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = inputs::serial::run(&port, baud, bus).await {
                        error!(error = %e, "serial adapter exited");
                    }
                });
            }
            InputConfig::Hid { device, scale, offset, interval_ms } => {
                let device = device.to_string_lossy().to_string();
                let (scale, offset, interval_ms) = (*scale, *offset, *interval_ms);
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = inputs::hid::run(&device, scale, offset, interval_ms, bus).await {
                        error!(error = %e, "hid adapter exited");
                    }
                });
            }
            InputConfig::Network { bind } => {
                let bind = bind.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = inputs::network::run(&bind, bus).await {
                        error!(error = %e, "network adapter exited");
                    }
                });
            }
            InputConfig::Web { bind } => {
                let bind = bind.clone();
                let bus = bus.clone();
                let log_controller = log_controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = inputs::web::run(&bind, bus, log_controller).await {
                        error!(error = %e, "web adapter exited");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_parse_comma_separated_list() {
        assert_eq!(parse_thresholds("10,20,30"), vec![10, 20, 30]);
    }

    #[test]
    fn thresholds_ignore_blank_segments() {
        assert_eq!(parse_thresholds("10,,20"), vec![10, 20]);
    }
}
