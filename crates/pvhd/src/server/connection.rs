//! Connection handler for individual control clients.
//!
//! Each connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming requests
//! - Checks tokens on privileged requests
//! - Forwards requests to the safety monitor, thermostat and health recorder
//!
//! # Panic-Free Guarantees
//!
//! Request failures are answered with an error message and the connection
//! stays open. Oversized messages, I/O errors and timeouts close it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pvh_protocol::{error_code, ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use super::GatewayContext;
use crate::auth::validate_token_shape;
use crate::safety::SafetyError;
use crate::thermostat::ThermostatError;

/// Writer shared between a connection and the event broadcaster.
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Subscribed connections keyed by client id.
pub type SubscribersMap = Arc<RwLock<HashMap<String, SubscriberWriter>>>;

/// Maximum number of concurrent subscribers.
pub const MAX_SUBSCRIBERS: usize = 16;

/// Maximum message size (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Read timeout for idle connections.
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientId = String;

pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: SubscriberWriter,
    context: GatewayContext,
    subscribers: SubscribersMap,
    client_id: Option<ClientId>,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: GatewayContext,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            context,
            subscribers,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the handshake and then the request loop. Returns the client id
    /// once the connection is closed.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        let handshake = match timeout(READ_TIMEOUT, self.handle_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };
        if let Err(e) = handshake {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        let client_id = self.client_id.clone();
        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects `connect` with a compatible protocol version.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match self.read_message().await {
            Ok(msg) => msg,
            Err(ConnectionError::ParseError(e)) => {
                self.send_message(DaemonMessage::rejected("Malformed handshake"))
                    .await?;
                return Err(ConnectionError::ParseError(e));
            }
            Err(e) => return Err(e),
        };

        let client_version = msg.protocol_version;
        if client_version.ensure_supported().is_err() {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned = match client_id {
                    Some(id) => format!("{id}-{}", self.connection_number),
                    None => format!("client-{}", self.connection_number),
                };
                self.client_id = Some(assigned.clone());
                self.send_message(DaemonMessage::connected(assigned)).await
            }
            other => {
                self.send_message(DaemonMessage::rejected(
                    "Expected connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Malformed request: {e}"),
                        error_code::INVALID_REQUEST,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e @ ConnectionError::MessageTooLarge { .. })) => {
                    let _ = self
                        .send_message(DaemonMessage::error_with_code(
                            &e.to_string(),
                            error_code::INVALID_REQUEST,
                        ))
                        .await;
                    return Err(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if msg.protocol_version.ensure_supported().is_err() {
                self.send_message(DaemonMessage::error_with_code(
                    &format!("Unsupported protocol version {}", msg.protocol_version),
                    error_code::INVALID_REQUEST,
                ))
                .await?;
                continue;
            }

            if matches!(msg.message, MessageType::Disconnect) {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(());
            }

            let reply = self.handle_message(msg.message).await;
            if let Some(reply) = reply {
                self.send_message(reply).await?;
            }
        }
    }

    /// Produces the reply for one request, if any.
    async fn handle_message(&mut self, message: MessageType) -> Option<DaemonMessage> {
        if message.is_privileged() {
            if let Err(denied) = self.authorize(&message) {
                return Some(denied);
            }
        }

        let reply = match message {
            MessageType::Connect { .. } => DaemonMessage::error_with_code(
                "Already connected",
                error_code::INVALID_REQUEST,
            ),

            MessageType::GetState => match self.context.safety.snapshot().await {
                Ok(snapshot) => DaemonMessage::state(snapshot),
                Err(e) => safety_error(&e),
            },

            MessageType::GetHealth { limit } => match self.context.health.report(limit).await {
                Ok(report) => DaemonMessage::health(report),
                Err(e) => DaemonMessage::error_with_code(&e.to_string(), error_code::UNAVAILABLE),
            },

            MessageType::SetSetpoint { tank, value, .. } => {
                match self.context.thermostat.set_setpoint(tank.clone(), value).await {
                    Ok(()) => {
                        info!(client_id = ?self.client_id, tank = %tank, value, "Setpoint changed");
                        DaemonMessage::SetpointAccepted { tank, value }
                    }
                    Err(e) => thermostat_error(&e),
                }
            }

            MessageType::AckAlarm { event_id, .. } => {
                match self.context.safety.acknowledge_alarm(event_id).await {
                    Ok(outcome) => {
                        info!(
                            client_id = ?self.client_id,
                            alarm = %outcome.event_id,
                            cleared = outcome.cleared,
                            "Alarm acknowledged"
                        );
                        DaemonMessage::AlarmAcknowledged {
                            event_id: outcome.event_id,
                            cleared: outcome.cleared,
                        }
                    }
                    Err(e) => safety_error(&e),
                }
            }

            MessageType::GetHistory { sensor, from, to } => {
                if let (Some(from), Some(to)) = (from, to) {
                    if from > to {
                        return Some(DaemonMessage::error_with_code(
                            "History range starts after it ends",
                            error_code::INVALID_REQUEST,
                        ));
                    }
                }
                match self.context.safety.history(sensor.clone(), from, to).await {
                    Ok(readings) => DaemonMessage::History { sensor, readings },
                    Err(e) => safety_error(&e),
                }
            }

            MessageType::Subscribe => return self.subscribe().await,

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                debug!(client_id = ?self.client_id, "Client unsubscribed");
                return None;
            }

            MessageType::Ping { seq } => DaemonMessage::pong(seq),

            MessageType::Disconnect => return None,
        };
        Some(reply)
    }

    /// Token shape is checked here; the decision belongs to the authorizer.
    fn authorize(&self, message: &MessageType) -> Result<(), DaemonMessage> {
        let token = match message {
            MessageType::SetSetpoint { token, .. } | MessageType::AckAlarm { token, .. } => token,
            _ => return Ok(()),
        };

        if let Err(e) = validate_token_shape(token) {
            warn!(client_id = ?self.client_id, error = %e, "Malformed token");
            return Err(DaemonMessage::error_with_code(
                &e.to_string(),
                error_code::INVALID_TOKEN,
            ));
        }
        if !self.context.authorizer.authorize(token) {
            warn!(client_id = ?self.client_id, "Privileged request denied");
            return Err(DaemonMessage::error_with_code(
                "Not authorized",
                error_code::UNAUTHORIZED,
            ));
        }
        Ok(())
    }

    /// Registers this connection for state-change events and sends the
    /// current snapshot as the initial state.
    async fn subscribe(&mut self) -> Option<DaemonMessage> {
        let client_id = self.client_id.clone()?;
        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                return Some(DaemonMessage::error_with_code(
                    &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    error_code::UNAVAILABLE,
                ));
            }
            subs.insert(client_id.clone(), Arc::clone(&self.writer));
        }
        debug!(client_id = %client_id, "Client subscribed to state changes");

        Some(match self.context.safety.snapshot().await {
            Ok(snapshot) => DaemonMessage::state(snapshot),
            Err(e) => safety_error(&e),
        })
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(line.trim_end())
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );
        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }
}

/// Writes one newline-terminated JSON message within [`WRITE_TIMEOUT`].
pub async fn write_message(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;
    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

fn safety_error(e: &SafetyError) -> DaemonMessage {
    let code = match e {
        SafetyError::AlarmNotFound(_) | SafetyError::UnknownSensor(_) => error_code::NOT_FOUND,
        SafetyError::InvariantViolation(_) | SafetyError::ChannelClosed => error_code::UNAVAILABLE,
    };
    DaemonMessage::error_with_code(&e.to_string(), code)
}

fn thermostat_error(e: &ThermostatError) -> DaemonMessage {
    let code = match e {
        ThermostatError::UnknownTank(_) => error_code::NOT_FOUND,
        ThermostatError::SetpointOutOfRange { .. } => error_code::OUT_OF_RANGE,
        ThermostatError::ChannelClosed => error_code::UNAVAILABLE,
    };
    DaemonMessage::error_with_code(&e.to_string(), code)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvh_core::{AlarmEventId, SensorId, TankId};

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_error_codes() {
        let not_found = safety_error(&SafetyError::AlarmNotFound(AlarmEventId(9)));
        assert!(matches!(
            not_found,
            DaemonMessage::Error { code: Some(ref c), .. } if c == error_code::NOT_FOUND
        ));

        let unknown = safety_error(&SafetyError::UnknownSensor(SensorId::new("x")));
        assert!(matches!(
            unknown,
            DaemonMessage::Error { code: Some(ref c), .. } if c == error_code::NOT_FOUND
        ));

        let range = thermostat_error(&ThermostatError::SetpointOutOfRange {
            tank: TankId::new("tank1"),
            value: 99.0,
            min: 30.0,
            max: 70.0,
        });
        assert!(matches!(
            range,
            DaemonMessage::Error { code: Some(ref c), .. } if c == error_code::OUT_OF_RANGE
        ));
    }
}
