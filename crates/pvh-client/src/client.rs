//! Control socket client.
//!
//! This module provides the `ControlClient` which handles:
//! - Connection and protocol handshake over the daemon's Unix socket
//! - Request/response calls with a per-request timeout
//! - State-change subscriptions
//! - Reconnection with exponential backoff
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this module.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use pvh_core::{
    AlarmEventId, HealthReport, SensorId, SensorReading, StateEvent, SystemSnapshot, TankId,
};
use pvh_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/pvhotwater/pvhd.sock";

// ============================================================================
// Configuration
// ============================================================================

/// Connection behavior for the control client.
///
/// # Example
///
/// ```rust
/// use pvh_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/pvhd.sock"),
///     request_timeout: Duration::from_secs(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,

    /// Sent in the handshake; the daemon appends a connection number.
    pub client_id: Option<String>,

    /// Limit for connecting plus the handshake, and for each request.
    pub request_timeout: Duration,

    /// Initial delay before the first retry after a connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            request_timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Control Client
// ============================================================================

/// A connected, handshaken session with the daemon.
///
/// Requests are answered in order. While subscribed, state-change events
/// that arrive between responses are queued and returned by
/// [`ControlClient::next_event`].
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
    events: VecDeque<StateEvent>,
}

impl ControlClient {
    /// Connects and performs the handshake within `request_timeout`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        match timeout(config.request_timeout, Self::connect_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn connect_inner(config: &ClientConfig) -> Result<Self> {
        if !config.socket_path.exists() {
            return Err(ClientError::Connection(format!(
                "socket {} not found",
                config.socket_path.display()
            )));
        }
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
            events: VecDeque::new(),
        };

        client
            .send(&ClientMessage::connect(config.client_id.clone()))
            .await?;
        match client.read().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
            }
            DaemonMessage::Rejected {
                reason,
                protocol_version,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                return Err(ClientError::Rejected(reason));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "Unexpected response to connect: {other:?}"
                )));
            }
        }

        Ok(client)
    }

    /// Connects, retrying with exponential backoff until connected or
    /// cancelled.
    pub async fn connect_with_retry(
        config: &ClientConfig,
        cancel_token: &CancellationToken,
    ) -> Result<Self> {
        let mut delay = config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            match Self::connect(config).await {
                Ok(client) => {
                    info!(attempt, "Connected to daemon");
                    return Ok(client);
                }
                Err(e @ ClientError::VersionMismatch { .. }) => return Err(e),
                Err(e) => {
                    if attempt == 1 {
                        warn!(
                            socket_path = %config.socket_path.display(),
                            error = %e,
                            "Daemon not reachable, will retry"
                        );
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    let next_delay_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
                    delay = Duration::from_millis(next_delay_ms).min(config.retry_max_delay);
                }
                _ = cancel_token.cancelled() => {
                    return Err(ClientError::Connection("cancelled".to_string()));
                }
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn get_state(&mut self) -> Result<SystemSnapshot> {
        match self.request(&ClientMessage::get_state()).await? {
            DaemonMessage::State { snapshot } => Ok(*snapshot),
            other => Err(unexpected("get_state", &other)),
        }
    }

    pub async fn get_health(&mut self, limit: Option<usize>) -> Result<HealthReport> {
        match self.request(&ClientMessage::get_health(limit)).await? {
            DaemonMessage::Health { report } => Ok(*report),
            other => Err(unexpected("get_health", &other)),
        }
    }

    /// Returns the setpoint the daemon accepted.
    pub async fn set_setpoint(&mut self, tank: TankId, value: f64, token: &str) -> Result<f64> {
        match self
            .request(&ClientMessage::set_setpoint(tank, value, token))
            .await?
        {
            DaemonMessage::SetpointAccepted { value, .. } => Ok(value),
            other => Err(unexpected("set_setpoint", &other)),
        }
    }

    /// Returns whether the alarm was cleared. An alarm whose condition still
    /// holds is acknowledged but stays raised.
    pub async fn ack_alarm(&mut self, event_id: AlarmEventId, token: &str) -> Result<bool> {
        match self
            .request(&ClientMessage::ack_alarm(event_id, token))
            .await?
        {
            DaemonMessage::AlarmAcknowledged { cleared, .. } => Ok(cleared),
            other => Err(unexpected("ack_alarm", &other)),
        }
    }

    pub async fn get_history(
        &mut self,
        sensor: SensorId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SensorReading>> {
        match self
            .request(&ClientMessage::get_history(sensor, from, to))
            .await?
        {
            DaemonMessage::History { readings, .. } => Ok(readings),
            other => Err(unexpected("get_history", &other)),
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<()> {
        match self.request(&ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Subscribes to state changes. Returns the snapshot the daemon sends
    /// as the initial state.
    pub async fn subscribe(&mut self) -> Result<SystemSnapshot> {
        match self.request(&ClientMessage::subscribe()).await? {
            DaemonMessage::State { snapshot } => Ok(*snapshot),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    /// Next state-change event. Waits without a timeout.
    pub async fn next_event(&mut self) -> Result<StateEvent> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read().await? {
                DaemonMessage::StateChanged { event } => return Ok(event),
                other => debug!(message = ?other, "Ignoring unsolicited message"),
            }
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await
    }

    /// Sends a request and waits for its response, queueing events that
    /// arrive first.
    async fn request(&mut self, message: &ClientMessage) -> Result<DaemonMessage> {
        self.send(message).await?;
        let limit = self.request_timeout;
        let response = timeout(limit, async {
            loop {
                match self.read().await? {
                    DaemonMessage::StateChanged { event } => self.events.push_back(event),
                    other => return Ok::<_, ClientError>(other),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        match response {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            other => Ok(other),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    async fn read(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn unexpected(request: &str, response: &DaemonMessage) -> ClientError {
    ClientError::Protocol(format!("Unexpected response to {request}: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Accepts one connection, answers the handshake and then `replies` in
    /// order, one per request line.
    async fn fake_daemon(path: PathBuf, replies: Vec<String>) {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let connected =
                serde_json::to_string(&DaemonMessage::connected("test-0".to_string())).unwrap();
            writer.write_all(format!("{connected}\n").as_bytes()).await.unwrap();

            for reply in replies {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
        });
    }

    fn config(path: PathBuf) -> ClientConfig {
        ClientConfig {
            socket_path: path,
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ControlClient::connect(&config(dir.path().join("absent.sock"))).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvhd.sock");
        let pong = serde_json::to_string(&DaemonMessage::pong(7)).unwrap();
        fake_daemon(path.clone(), vec![format!("{pong}\n")]).await;

        let mut client = ControlClient::connect(&config(path)).await.unwrap();
        assert_eq!(client.client_id(), "test-0");
        client.ping(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_error_carries_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvhd.sock");
        let error = serde_json::to_string(&DaemonMessage::error_with_code(
            "Not authorized",
            pvh_protocol::error_code::UNAUTHORIZED,
        ))
        .unwrap();
        fake_daemon(path.clone(), vec![format!("{error}\n")]).await;

        let mut client = ControlClient::connect(&config(path)).await.unwrap();
        let err = client
            .ack_alarm(AlarmEventId(1), "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("unauthorized"));
    }

    #[tokio::test]
    async fn test_events_before_response_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvhd.sock");
        let event = serde_json::to_string(&DaemonMessage::StateChanged {
            event: StateEvent::LinkChanged {
                from: pvh_core::LinkState::Up,
                to: pvh_core::LinkState::Degraded,
            },
        })
        .unwrap();
        let pong = serde_json::to_string(&DaemonMessage::pong(1)).unwrap();
        fake_daemon(path.clone(), vec![format!("{event}\n{pong}\n")]).await;

        let mut client = ControlClient::connect(&config(path)).await.unwrap();
        client.ping(1).await.unwrap();
        assert!(matches!(
            client.next_event().await.unwrap(),
            StateEvent::LinkChanged { .. }
        ));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvhd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let connected =
                serde_json::to_string(&DaemonMessage::connected("quiet".to_string())).unwrap();
            writer.write_all(format!("{connected}\n").as_bytes()).await.unwrap();
            // Never answers again but keeps the socket open.
            sleep(Duration::from_secs(60)).await;
            drop(reader);
        });

        let mut client = ControlClient::connect(&ClientConfig {
            request_timeout: Duration::from_millis(100),
            ..config(path)
        })
        .await
        .unwrap();
        assert!(matches!(client.get_state().await, Err(ClientError::Timeout)));
    }
}
