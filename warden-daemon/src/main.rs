//! Warden VPN daemon
//!
//! Privileged background service that owns the tunnel, the kill-switch and
//! the DNS settings on behalf of local clients.

mod launcher;

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_engine::preferences::PreferencesStore;
use warden_engine::{Components, Config, ProtocolServer, Service};

use crate::launcher::PortFile;

const DEFAULT_CONFIG: &str = "/etc/warden/warden.toml";
const EXIT_FAILURE: u8 = 1;
const EXIT_CLEANUP_FAILED: u8 = 2;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Warden - privileged VPN control daemon
#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Force debug logging for this run
    #[arg(long)]
    logging: bool,

    /// Remove firewall rules and log out, then exit
    #[arg(long)]
    cleanup: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "warden.toml")]
        output: PathBuf,
    },
}

/// Accept the legacy single-dash flags (`-logging`, `-cleanup`) in any case
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str().map(str::to_ascii_lowercase).as_deref() {
            Some("-logging") | Some("--logging") => OsString::from("--logging"),
            Some("-cleanup") | Some("--cleanup") => OsString::from("--cleanup"),
            _ => arg,
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    if let Some(Commands::GenConfig { output }) = &cli.command {
        return match generate_config(output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(EXIT_FAILURE)
            }
        };
    }

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if let Err(e) = init_logging(&log_level(&cli, &config), config.daemon.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_FAILURE);
    }

    if cli.cleanup {
        return match run_cleanup(&config).await {
            Ok(()) => {
                info!("Cleanup finished");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cleanup failed: {:#}", e);
                ExitCode::from(EXIT_CLEANUP_FAILED)
            }
        };
    }

    match run_daemon(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Daemon failed: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// `--logging`, then `--log-level`, then the persisted preference, then the configuration
fn log_level(cli: &Cli, config: &Config) -> String {
    if cli.logging {
        return "debug".into();
    }
    if let Some(level) = &cli.log_level {
        return level.clone();
    }
    if PreferencesStore::load(&config.daemon.settings_file).get().is_logging {
        return "debug".into();
    }
    config.daemon.log_level.clone()
}

fn init_logging(level: &str, log_file: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    println!("Sample configuration written to {:?}", output);
    println!("\nReview the helper paths before starting the daemon.");

    Ok(())
}

async fn run_cleanup(config: &Config) -> Result<()> {
    info!("Cleaning up daemon state...");
    let components = Components::from_config(config).context("Failed to set up the service")?;
    let service = Service::new(components);
    service.cleanup().await.context("Cleanup incomplete")?;
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting Warden daemon {}...", env!("CARGO_PKG_VERSION"));
    launcher::check_privileges();

    let port_path = config.daemon.port_file.clone();
    launcher::ensure_single_instance(&port_path).await?;

    let components = Components::from_config(&config).context("Failed to set up the service")?;
    let service = Service::new(components);
    service.init().await.context("Failed to initialise the service")?;

    let listener = ProtocolServer::bind().await.context("Failed to bind the control port")?;
    let port = listener
        .local_addr()
        .context("Control port address unknown")?
        .port();
    let secret = launcher::generate_secret();
    let server = ProtocolServer::new(service.clone(), secret);

    // subscribe before anything can request a stop
    let mut stop = service.shutdown_signal();
    let server_handle = tokio::spawn(server.run(listener, service.shutdown_signal()));
    let port_file = PortFile::write(&port_path, port, secret)?;

    let tasks = service.start().await;
    info!("Daemon ready; clients connect via {:?}", port_file.path());

    tokio::select! {
        result = wait_for_shutdown() => result?,
        _ = stop.recv() => info!("Stop requested by a client"),
    }

    info!("Shutting down...");
    service.shutdown().await;

    if tokio::time::timeout(STOP_TIMEOUT, server_handle).await.is_err() {
        warn!("Control protocol did not stop in time");
    }
    for task in tasks {
        if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    drop(port_file);

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
