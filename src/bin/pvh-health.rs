//! pvh-health - Container health check for the pvhotwater daemon
//!
//! Asks the daemon for its live health verdict and prints a one-line
//! summary. Exits 0 only when the daemon answers in time and reports itself
//! healthy (alarm level not CRITICAL and every subsystem fresh).
//!
//! ```text
//! pvh-health                          # default socket, 3 s timeout
//! pvh-health --socket /tmp/pvhd.sock --timeout-ms 500 --verbose
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::time::timeout;

use pvh_client::{ClientConfig, ControlClient, DEFAULT_SOCKET_PATH};
use pvh_core::HealthReport;

/// Exit code when the daemon answered but is unhealthy.
const EXIT_UNHEALTHY: u8 = 1;

/// Exit code when the daemon could not be asked.
const EXIT_UNREACHABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "pvh-health", version, about = "Health check for the pvhotwater daemon")]
struct Args {
    /// Daemon control socket
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Overall time limit for connecting and answering
    #[arg(short, long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Also print per-subsystem status
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let limit = Duration::from_millis(args.timeout_ms);

    let config = ClientConfig {
        socket_path: args.socket.clone(),
        client_id: Some("pvh-health".to_string()),
        request_timeout: limit,
        ..ClientConfig::default()
    };

    let query = async {
        let mut client = ControlClient::connect(&config).await?;
        let report = client.get_health(Some(0)).await?;
        let _ = client.disconnect().await;
        Ok::<HealthReport, pvh_client::ClientError>(report)
    };

    let report = match timeout(limit, query).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            println!("UNHEALTHY: daemon unreachable at {}: {e}", args.socket.display());
            return ExitCode::from(EXIT_UNREACHABLE);
        }
        Err(_) => {
            println!(
                "UNHEALTHY: daemon did not answer within {} ms",
                args.timeout_ms
            );
            return ExitCode::from(EXIT_UNREACHABLE);
        }
    };

    let verdict = if report.healthy { "HEALTHY" } else { "UNHEALTHY" };
    println!("{verdict}: {}", report.summary);

    if args.verbose {
        for (name, status) in &report.subsystems {
            println!(
                "  {name}: last report {} ms ago (expected every {} ms), {} reports{}",
                status.last_report_age_ms,
                status.expected_interval_ms,
                status.counter,
                if status.is_fresh() { "" } else { " STALE" }
            );
        }
    }

    if report.healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_UNHEALTHY)
    }
}
