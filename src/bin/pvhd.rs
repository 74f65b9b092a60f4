//! pvhd - Control and safety daemon for a PV hot-water installation
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! pvhd start
//!
//! # Start the daemon (background/daemonized)
//! pvhd start -d --config /etc/pvhotwater/pvhotwater.toml
//!
//! # Stop the daemon
//! pvhd stop
//!
//! # Check daemon status
//! pvhd status
//!
//! # Enable debug logging
//! RUST_LOG=pvhd=debug pvhd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown, circuits forced OFF
//!
//! The process exits non-zero when the safety monitor detects corrupted
//! state so an external supervisor restarts it.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pvhd::config::DaemonConfig;

/// pvhotwater control and safety daemon
#[derive(Parser, Debug)]
#[command(name = "pvhd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Configuration file (default: $PVHOTWATER_CONF_DIR/pvhotwater.toml,
        /// else ./pvhotwater.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pvhotwater")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("pvhd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("pvhd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// PID of the running daemon. Removes a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            bail!("Invalid PID {pid}");
        };
        // SAFETY: kill(2) with a PID read from our own PID file.
        let result = unsafe { libc::kill(raw, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<(DaemonConfig, PathBuf)> {
    let path = DaemonConfig::resolve_path(explicit.as_deref());
    let config = if path.exists() {
        DaemonConfig::load(&path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?
    } else if explicit.is_some() {
        bail!("Configuration file {} not found", path.display());
    } else {
        eprintln!(
            "No configuration at {}, using defaults (no sensors or tanks)",
            path.display()
        );
        DaemonConfig::default()
    };
    Ok((config, path))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'pvhd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal.
            let (config, path) = load_config(config)?;

            if daemon {
                daemonize()?;
            }
            write_pid()?;

            let result = run_daemon(config, path);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Ok((config, _)) = load_config(config) {
                    if config.daemon.socket_path.exists() {
                        println!("Socket: {}", config.daemon.socket_path.display());
                    }
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, config_path: PathBuf) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pvhd=info".parse()?)
                .add_directive("pvh_core=info".parse()?)
                .add_directive("pvh_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = %config_path.display(),
        "pvhd starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let watch_path = config_path.exists().then_some(config_path);
    if let Err(e) = pvhd::daemon::run(config, watch_path, cancel_token).await {
        error!(error = %e, "Daemon failed");
        return Err(e.into());
    }

    info!("pvhd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
