//! Daemon assembly and shutdown.
//!
//! Starts every task against one configuration channel and one
//! cancellation token, then waits for shutdown or for the safety monitor
//! to fail.
//!
//! # Panic-Free Guarantees
//!
//! A task that does not stop within the shutdown grace period is aborted.
//! A safety monitor failure cancels every other task and is returned as an
//! error so the process exits non-zero.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pvh_core::DomainError;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::DigestAuthorizer;
use crate::config::{spawn_config_watcher, ConfigError, DaemonConfig};
use crate::gfci::spawn_gfci_link;
use crate::health::{build_store, spawn_health_recorder};
use crate::safety::{spawn_safety_monitor, SafetyError};
use crate::sensor_hub::{bind_satellite, spawn_sensor_hub};
use crate::server::{ControlServer, GatewayContext, ServerError};
use crate::thermostat::spawn_thermostat;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Safety monitor stopped: {0}")]
    Safety(#[from] SafetyError),

    #[error("Safety monitor task failed: {0}")]
    SafetyTask(String),
}

/// Runs the daemon until `cancel_token` is cancelled or the safety monitor
/// fails.
///
/// `config_path` enables hot reload of that file.
pub async fn run(
    config: DaemonConfig,
    config_path: Option<PathBuf>,
    cancel_token: CancellationToken,
) -> Result<(), DaemonError> {
    let grace = config.shutdown_grace();
    let socket_path = config.daemon.socket_path.clone();
    let satellite_bind = config.satellite.bind;
    let authorizer = DigestAuthorizer::new(config.auth.token_sha256.clone());
    if authorizer.is_deny_all() {
        warn!("No operator token digests configured, privileged requests will be denied");
    }
    let store = build_store(&config);

    let (config_tx, config_rx) = watch::channel(Arc::new(config));

    let (safety, outputs, mut safety_join) =
        spawn_safety_monitor(config_rx.clone(), cancel_token.clone());
    info!("Safety monitor started");

    let (thermostat, thermostat_join) = spawn_thermostat(
        safety.clone(),
        outputs.saturation_acks,
        config_rx.clone(),
        cancel_token.clone(),
    );

    let (health, health_join) = spawn_health_recorder(
        store,
        safety.clone(),
        config_rx.clone(),
        cancel_token.clone(),
    );

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
        ("thermostat", thermostat_join),
        ("health_recorder", health_join),
    ];

    let startup = async {
        let socket = bind_satellite(satellite_bind)
            .await
            .map_err(|source| DaemonError::Bind {
                what: "satellite socket",
                source,
            })?;
        let hub = spawn_sensor_hub(
            socket,
            safety.clone(),
            thermostat.clone(),
            config_rx.clone(),
            cancel_token.clone(),
        )?;

        let server = ControlServer::new(
            socket_path,
            GatewayContext {
                safety: safety.clone(),
                thermostat: thermostat.clone(),
                health,
                authorizer: Arc::new(authorizer),
            },
            cancel_token.clone(),
        );
        let listener = server.bind()?;
        Ok::<_, DaemonError>((hub, server, listener))
    };

    let (hub, server, listener) = match startup.await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "Daemon startup failed");
            cancel_token.cancel();
            let _ = join_with_grace("safety_monitor", safety_join, grace).await;
            for (name, join) in tasks {
                join_with_grace(name, join, grace).await;
            }
            return Err(e);
        }
    };
    tasks.push(("sensor_hub", hub));
    tasks.push((
        "gfci_link",
        spawn_gfci_link(
            safety.clone(),
            outputs.shutoffs,
            config_rx.clone(),
            cancel_token.clone(),
        ),
    ));

    tasks.push((
        "control_server",
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!(error = %e, "Control server error");
            }
        }),
    ));

    // Held so the config channel stays open without a watcher.
    let _config_tx = match config_path {
        Some(path) => {
            match spawn_config_watcher(path, config_tx.clone(), cancel_token.clone()) {
                Ok(join) => tasks.push(("config_watcher", join)),
                Err(e) => warn!(error = %e, "Config hot reload unavailable"),
            }
            config_tx
        }
        None => config_tx,
    };

    info!("Daemon running");

    let mut outcome = Ok(());
    let mut safety_done = false;
    tokio::select! {
        _ = cancel_token.cancelled() => {
            info!("Shutdown requested");
        }
        result = &mut safety_join => {
            safety_done = true;
            outcome = safety_result(result);
            if let Err(ref e) = outcome {
                error!(error = %e, "Safety monitor failed, circuits forced off, stopping daemon");
            }
        }
    }

    cancel_token.cancel();

    // Tasks that drive relays first, the safety monitor last.
    for (name, join) in tasks {
        join_with_grace(name, join, grace).await;
    }
    if !safety_done {
        if let Some(result) = join_with_grace("safety_monitor", safety_join, grace).await {
            if let Err(e) = result {
                error!(error = %e, "Safety monitor failed during shutdown");
                if outcome.is_ok() {
                    outcome = Err(DaemonError::Safety(e));
                }
            }
        }
    }

    info!("Daemon stopped");
    outcome
}

fn safety_result(
    result: Result<Result<(), SafetyError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DaemonError::Safety(e)),
        Err(e) => Err(DaemonError::SafetyTask(e.to_string())),
    }
}

/// Waits up to `grace` for a cancelled task, then aborts it.
async fn join_with_grace<T>(name: &str, mut join: JoinHandle<T>, grace: Duration) -> Option<T> {
    match timeout(grace, &mut join).await {
        Ok(Ok(value)) => {
            debug!(task = name, "Task stopped");
            Some(value)
        }
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task failed");
            None
        }
        Err(_) => {
            warn!(
                task = name,
                grace_ms = grace.as_millis() as u64,
                "Task did not stop in time, aborting"
            );
            join.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let join = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let result = join_with_grace("stuck", join, Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_finished_task_returns_value() {
        let join = tokio::spawn(async { 7 });
        assert_eq!(join_with_grace("quick", join, Duration::from_secs(1)).await, Some(7));
    }

    #[test]
    fn test_safety_failure_is_daemon_error() {
        let outcome = safety_result(Ok(Err(SafetyError::InvariantViolation(
            "circuit 1 on with link down".to_string(),
        ))));
        assert!(matches!(outcome, Err(DaemonError::Safety(_))));
    }
}
