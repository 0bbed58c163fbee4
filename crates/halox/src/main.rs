mod cli;
mod config;
mod error;
mod mqtt;

use std::ffi::OsStr;
use std::path::Path;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use halox_core::SessionSupervisor;

use crate::cli::Cli;
use crate::error::BridgeError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configuration errors are fatal before logging is even up.
    let file = match config::load(&cli.config) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_tracing(cli.verbose, file.logging.file.as_deref());

    if let Err(e) = run(cli, file).await {
        error!(error = %e, "bridge exiting");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

/// Tracing to stderr, or to the configured log file. The returned guard
/// keeps the non-blocking writer alive for the life of the process.
fn init_tracing(
    verbosity: u8,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_else(|| OsStr::new("halox.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn run(cli: Cli, file: config::FileConfig) -> Result<(), BridgeError> {
    let controller = config::controller_config(&file)?;

    info!("halox starting");

    let cancel = CancellationToken::new();
    let (supervisor, ports) = SessionSupervisor::connect(&controller, cancel.clone()).await?;

    if cli.print_hass {
        print_hass_yaml(&supervisor);
        return Ok(());
    }

    let mut supervisor_task = tokio::spawn(supervisor.run());
    let mut mqtt_task = tokio::spawn(mqtt::run(
        file.mqtt.host.clone(),
        file.mqtt.port,
        ports.state_out,
        ports.command_in,
        ports.registry,
        cancel.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("signal received, exiting");
            cancel.cancel();
        }
        result = &mut supervisor_task => {
            cancel.cancel();
            let _ = mqtt_task.await;
            return flatten(result.map(|r| r.map_err(BridgeError::from)), "supervisor");
        }
        result = &mut mqtt_task => {
            cancel.cancel();
            let _ = supervisor_task.await;
            return flatten(result.map(|r| r.map_err(BridgeError::from)), "MQTT adapter");
        }
    }

    let _ = supervisor_task.await;
    let _ = mqtt_task.await;
    Ok(())
}

/// Unwrap a joined task result, treating a panic as logged-but-done.
fn flatten(
    result: Result<Result<(), BridgeError>, tokio::task::JoinError>,
    task: &str,
) -> Result<(), BridgeError> {
    match result {
        Ok(inner) => inner,
        Err(e) => {
            warn!(error = %e, task, "task ended abnormally");
            Ok(())
        }
    }
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_hass_yaml(supervisor: &SessionSupervisor) {
    println!("switch:");
    for device in supervisor.registry().devices() {
        println!("{}", device.hass_switch_yaml());
    }
}
