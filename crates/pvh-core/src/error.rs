//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// A state machine was asked for a transition it does not allow.
    #[error("Illegal transition: cannot {action} from {from}")]
    IllegalTransition { from: String, action: &'static str },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Two calibration profiles claim the same sensor id
    #[error("Duplicate calibration profile for sensor {0}")]
    DuplicateSensor(String),

    /// Two calibration profiles claim the same satellite channel
    #[error("Duplicate satellite channel {0}")]
    DuplicateChannel(u8),

    /// Circuit number outside the installation's circuits
    #[error("Unknown circuit number: {0}")]
    UnknownCircuit(u8),
}

impl DomainError {
    /// Shorthand for an invalid field value error.
    pub fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidFieldValue {
            field: field.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::invalid("hysteresis", -1.0, "> 0");
        assert_eq!(err.to_string(), "Invalid hysteresis: -1 (expected > 0)");

        let err = DomainError::IllegalTransition {
            from: "fault_latched".to_string(),
            action: "turn on",
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition: cannot turn on from fault_latched"
        );
    }
}
