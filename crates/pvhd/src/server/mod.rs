//! Unix socket control server.
//!
//! The server:
//! - Listens on a Unix socket for control clients (the API process, the
//!   health-check CLI)
//! - Spawns a ConnectionHandler for each client
//! - Forwards safety monitor state-change events to subscribers
//! - Stops on the daemon's CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ControlServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌──────────────────────────────────────┐
//! │ConnectionHandler│────▶│ Safety / Thermostat / Health handles │
//! │   (per client)  │     └──────────────────────────────────────┘
//! └─────────────────┘                    │ StateEvent
//!         ▲                              ▼
//!         └──────────── event broadcaster (subscribers)
//! ```
//!
//! The gateway holds no authoritative state: every request becomes a message
//! to the task that owns the data.

mod connection;

pub use connection::{
    write_message, ConnectionError, ConnectionHandler, SubscriberWriter, SubscribersMap,
    MAX_MESSAGE_SIZE, MAX_SUBSCRIBERS, READ_TIMEOUT, WRITE_TIMEOUT,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pvh_core::StateEvent;
use pvh_protocol::DaemonMessage;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::health::HealthHandle;
use crate::safety::SafetyHandle;
use crate::thermostat::ThermostatHandle;

/// Everything a connection needs to serve requests.
#[derive(Clone)]
pub struct GatewayContext {
    pub safety: SafetyHandle,
    pub thermostat: ThermostatHandle,
    pub health: HealthHandle,
    pub authorizer: Arc<dyn Authorizer>,
}

pub struct ControlServer {
    socket_path: PathBuf,
    context: GatewayContext,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    subscribers: SubscribersMap,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        context: GatewayContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            context,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket, replacing a stale socket file.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup)?;
            }
        }
        UnixListener::bind(&self.socket_path).map_err(setup)
    }

    /// Binds and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until cancelled.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), ServerError> {
        info!(socket = %self.socket_path.display(), "Control server listening");

        self.spawn_event_broadcaster();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let context = self.context.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                reader,
                writer,
                context,
                Arc::clone(&subscribers),
                connection_number,
            );

            let client_id = tokio::select! {
                id = handler.run() => id,
                _ = cancel_token.cancelled() => None,
            };

            if let Some(id) = client_id {
                if subscribers.write().await.remove(&id).is_some() {
                    debug!(client_id = %id, "Removed disconnected subscriber");
                }
            }
        });
    }

    fn spawn_event_broadcaster(&self) {
        let mut event_rx = self.context.safety.subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event broadcaster shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => broadcast_event(&subscribers, event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event broadcaster lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn cleanup(&self) {
        self.subscribers.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}

/// Sends one event to every subscriber, dropping those that fail.
async fn broadcast_event(subscribers: &SubscribersMap, event: StateEvent) {
    let msg = DaemonMessage::StateChanged { event };

    let subs = subscribers.read().await;
    let mut failed_clients = Vec::new();
    for (client_id, writer) in subs.iter() {
        if let Err(e) = write_message(writer, &msg).await {
            debug!(client_id = %client_id, error = %e, "Failed to send event to subscriber");
            failed_clients.push(client_id.clone());
        }
    }
    drop(subs);

    if !failed_clients.is_empty() {
        let mut subs = subscribers.write().await;
        for client_id in failed_clients {
            subs.remove(&client_id);
            debug!(client_id = %client_id, "Removed failed subscriber");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/run/pvhotwater/pvhd.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/run/pvhotwater/pvhd.sock"));
        assert!(err.to_string().contains("permission denied"));
    }
}
