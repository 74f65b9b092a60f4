//! Local control protocol messages.
//!
//! Newline-delimited JSON over the daemon's Unix socket. Every client
//! message carries the protocol version; the first one must be `connect`.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use pvh_core::{
    AlarmEventId, HealthReport, SensorId, SensorReading, StateEvent, SystemSnapshot, TankId,
};
use serde::{Deserialize, Serialize};

/// Error codes carried in [`DaemonMessage::Error`].
pub mod error_code {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const OUT_OF_RANGE: &str = "out_of_range";
    pub const UNAVAILABLE: &str = "unavailable";
}

/// Requests a client can make.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Current system snapshot
    GetState,

    /// Live health verdict plus up to `limit` recent records
    GetHealth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Change a tank setpoint (privileged)
    SetSetpoint {
        tank: TankId,
        value: f64,
        token: String,
    },

    /// Acknowledge an alarm (privileged)
    AckAlarm {
        event_id: AlarmEventId,
        token: String,
    },

    /// Retained readings of one sensor, optionally bounded in time
    GetHistory {
        sensor: SensorId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<DateTime<Utc>>,
    },

    /// Stream state-change notifications on this connection
    Subscribe,

    Unsubscribe,

    Ping {
        seq: u64,
    },

    Disconnect,
}

impl MessageType {
    /// Operations that need a valid token.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::SetSetpoint { .. } | Self::AckAlarm { .. })
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn get_state() -> Self {
        Self::new(MessageType::GetState)
    }

    pub fn get_health(limit: Option<usize>) -> Self {
        Self::new(MessageType::GetHealth { limit })
    }

    pub fn set_setpoint(tank: TankId, value: f64, token: impl Into<String>) -> Self {
        Self::new(MessageType::SetSetpoint {
            tank,
            value,
            token: token.into(),
        })
    }

    pub fn ack_alarm(event_id: AlarmEventId, token: impl Into<String>) -> Self {
        Self::new(MessageType::AckAlarm {
            event_id,
            token: token.into(),
        })
    }

    pub fn get_history(
        sensor: SensorId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(MessageType::GetHistory { sensor, from, to })
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, missing handshake)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    State {
        snapshot: Box<SystemSnapshot>,
    },

    Health {
        report: Box<HealthReport>,
    },

    SetpointAccepted {
        tank: TankId,
        value: f64,
    },

    AlarmAcknowledged {
        event_id: AlarmEventId,
        /// False when the condition still holds and the alarm stays raised.
        cleared: bool,
    },

    History {
        sensor: SensorId,
        readings: Vec<SensorReading>,
    },

    /// Pushed to subscribers
    StateChanged {
        event: StateEvent,
    },

    Pong {
        seq: u64,
    },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn state(snapshot: SystemSnapshot) -> Self {
        Self::State {
            snapshot: Box::new(snapshot),
        }
    }

    pub fn health(report: HealthReport) -> Self {
        Self::Health {
            report: Box::new(report),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_is_flat() {
        let msg = ClientMessage::set_setpoint(TankId::new("tank1"), 55.0, "secret");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "set_setpoint");
        assert_eq!(json["tank"], "tank1");
        assert_eq!(json["value"], 55.0);
        assert_eq!(json["protocol_version"]["major"], 1);
    }

    #[test]
    fn test_parse_hand_written_request() {
        let line = r#"{"protocol_version":{"major":1,"minor":0},"type":"ack_alarm","event_id":4,"token":"t"}"#;
        let msg: ClientMessage = serde_json::from_str(line).unwrap();
        match msg.message {
            MessageType::AckAlarm { event_id, token } => {
                assert_eq!(event_id, AlarmEventId(4));
                assert_eq!(token, "t");
            }
            other => panic!("Expected AckAlarm, got {other:?}"),
        }
    }

    #[test]
    fn test_get_health_limit_is_optional() {
        let line = r#"{"protocol_version":{"major":1,"minor":0},"type":"get_health"}"#;
        let msg: ClientMessage = serde_json::from_str(line).unwrap();
        assert!(matches!(msg.message, MessageType::GetHealth { limit: None }));
    }

    #[test]
    fn test_privileged_operations() {
        assert!(ClientMessage::ack_alarm(AlarmEventId(1), "x").message.is_privileged());
        assert!(!ClientMessage::get_state().message.is_privileged());
    }

    #[test]
    fn test_error_serialization() {
        let msg = DaemonMessage::error_with_code("nope", error_code::UNAUTHORIZED);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"unauthorized\""));
    }
}
