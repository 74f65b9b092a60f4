//! Error types for the control client.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this module.

use std::io;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors talking to the daemon.
///
/// Connection errors usually mean the daemon is not running or the socket
/// path is wrong. `Daemon` carries an error the daemon answered with,
/// including its machine-readable code.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connection(String),

    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon refused the handshake.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Daemon error: {message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("Daemon did not answer in time")]
    Timeout,

    #[error("Daemon closed the connection")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ClientError {
    /// The daemon's error code, if this is a daemon error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Daemon { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_display() {
        let error = ClientError::VersionMismatch {
            client_version: "1.0".to_string(),
            daemon_version: "2.0".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("client: 1.0"));
        assert!(display.contains("daemon: 2.0"));
    }

    #[test]
    fn test_daemon_error_code() {
        let error = ClientError::Daemon {
            message: "Not authorized".to_string(),
            code: Some("unauthorized".to_string()),
        };
        assert_eq!(error.code(), Some("unauthorized"));
        assert_eq!(ClientError::Timeout.code(), None);
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "socket not found");
        let error: ClientError = io_error.into();
        assert!(matches!(error, ClientError::Io(_)));
    }
}
