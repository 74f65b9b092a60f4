//! Health recorder.
//!
//! Periodically captures subsystem liveness, the alarm level and process
//! metrics into a [`HealthRecord`], stores it and expires records older than
//! the retention horizon. Queries go through [`HealthHandle`].
//!
//! # Panic-Free Guarantees
//!
//! Store failures never stop the recorder: records are kept in a bounded
//! in-memory ring and flagged `store_degraded`.

use std::sync::Arc;

use chrono::Utc;
use pvh_core::{HealthRecord, HealthReport};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod recorder;
mod store;

pub use recorder::{summarize, HealthRecorder, DEFAULT_RECENT, MAX_RECENT};
pub use store::{JsonlStore, MemoryStore, RecordStore, StoreError};

use crate::config::DaemonConfig;
use crate::safety::{SafetyError, SafetyHandle};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Safety monitor unavailable: {0}")]
    Safety(#[from] SafetyError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Health recorder channel closed")]
    ChannelClosed,
}

pub enum HealthCommand {
    GetReport {
        limit: Option<usize>,
        respond_to: oneshot::Sender<Result<HealthReport, HealthError>>,
    },
    GetRecent {
        limit: usize,
        respond_to: oneshot::Sender<Vec<HealthRecord>>,
    },
}

/// Cheap-to-clone handle to the health recorder.
#[derive(Clone)]
pub struct HealthHandle {
    sender: mpsc::Sender<HealthCommand>,
}

impl HealthHandle {
    pub fn new(sender: mpsc::Sender<HealthCommand>) -> Self {
        Self { sender }
    }

    /// Live verdict plus up to `limit` recent records (default 10).
    pub async fn report(&self, limit: Option<usize>) -> Result<HealthReport, HealthError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::GetReport {
                limit,
                respond_to: tx,
            })
            .await
            .map_err(|_| HealthError::ChannelClosed)?;
        rx.await.map_err(|_| HealthError::ChannelClosed)?
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<HealthRecord>, HealthError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::GetRecent {
                limit,
                respond_to: tx,
            })
            .await
            .map_err(|_| HealthError::ChannelClosed)?;
        rx.await.map_err(|_| HealthError::ChannelClosed)
    }
}

/// Builds the configured record store.
pub fn build_store(config: &DaemonConfig) -> Arc<dyn RecordStore> {
    match &config.health.store_path {
        Some(path) => {
            info!(path = %path.display(), "Health records stored on disk");
            Arc::new(JsonlStore::new(path.clone()))
        }
        None => {
            info!("Health records kept in memory");
            Arc::new(MemoryStore::new(config.health.memory_capacity))
        }
    }
}

/// Spawns the health recorder with the given store.
pub fn spawn_health_recorder(
    store: Arc<dyn RecordStore>,
    safety: SafetyHandle,
    mut config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> (HealthHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);

    let join = tokio::spawn(async move {
        let current = config.borrow_and_update().clone();
        let mut recorder = HealthRecorder::new(
            store,
            safety,
            current.retention(),
            current.health.memory_capacity,
        );
        let mut tick = interval(current.health_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut config_open = true;

        info!(
            interval_secs = current.health.interval_secs,
            retention_secs = current.health.retention_secs,
            "Health recorder started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        HealthCommand::GetReport { limit, respond_to } => {
                            let _ = respond_to.send(recorder.report(limit).await);
                        }
                        HealthCommand::GetRecent { limit, respond_to } => {
                            let _ = respond_to.send(recorder.recent(limit, Utc::now()).await);
                        }
                    }
                }

                _ = tick.tick() => {
                    if let Err(e) = recorder.record_cycle(Utc::now()).await {
                        warn!(error = %e, "Health record skipped");
                        if matches!(e, HealthError::Safety(SafetyError::ChannelClosed)) {
                            break;
                        }
                    }
                }

                changed = config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let next = config.borrow_and_update().clone();
                    recorder.set_retention(next.retention());
                    if tick.period() != next.health_interval() {
                        tick = interval(next.health_interval());
                        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    debug!("Health recorder settings updated");
                }
            }
        }

        info!("Health recorder stopped");
    });

    (HealthHandle::new(tx), join)
}
