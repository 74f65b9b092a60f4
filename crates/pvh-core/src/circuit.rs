//! Heater circuits and their power state machine.

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two switched heater circuits on the exterior panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CircuitId {
    One,
    Two,
}

impl CircuitId {
    /// Every circuit in the installation.
    pub const ALL: [CircuitId; 2] = [CircuitId::One, CircuitId::Two];

    /// Wire/config number of the circuit (1 or 2).
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }
}

impl TryFrom<u8> for CircuitId {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_number(value).ok_or(DomainError::UnknownCircuit(value))
    }
}

impl From<CircuitId> for u8 {
    fn from(circuit: CircuitId) -> Self {
        circuit.number()
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit-{}", self.number())
    }
}

/// Which side of the GFCI detected the ground fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSide {
    Line,
    Load,
}

impl FaultSide {
    pub fn code(self) -> u8 {
        match self {
            Self::Line => 1,
            Self::Load => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Line),
            2 => Some(Self::Load),
            _ => None,
        }
    }
}

impl fmt::Display for FaultSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => write!(f, "line"),
            Self::Load => write!(f, "load"),
        }
    }
}

// ============================================================================
// Circuit State Machine
// ============================================================================

/// Power state of one circuit.
///
/// Only the safety monitor calls the transition methods; everything else
/// proposes. `Off` is the default so a freshly started daemon never powers
/// anything until every precondition has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    On,
    #[default]
    Off,
    /// Ground fault reported, shutoff sent, bridge confirmation outstanding.
    FaultPending,
    /// Shutoff confirmed. Stays latched until an operator acknowledges.
    FaultLatched,
}

impl CircuitState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::FaultPending => "fault_pending",
            Self::FaultLatched => "fault_latched",
        }
    }

    /// True only when the heater relay should be energized.
    #[must_use]
    pub fn is_energized(&self) -> bool {
        matches!(self, Self::On)
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::FaultPending | Self::FaultLatched)
    }

    /// Off → On. Faulted circuits refuse.
    pub fn turn_on(self) -> DomainResult<Self> {
        match self {
            Self::On | Self::Off => Ok(Self::On),
            Self::FaultPending | Self::FaultLatched => Err(DomainError::IllegalTransition {
                from: self.label().to_string(),
                action: "turn on",
            }),
        }
    }

    /// On → Off. Faulted circuits are already de-energized and stay faulted.
    #[must_use]
    pub fn turn_off(self) -> Self {
        match self {
            Self::On | Self::Off => Self::Off,
            Self::FaultPending => Self::FaultPending,
            Self::FaultLatched => Self::FaultLatched,
        }
    }

    /// A ground fault was reported for this circuit. A latched circuit goes
    /// back to pending so the new shutoff is confirmed again.
    #[must_use]
    pub fn fault_reported(self) -> Self {
        match self {
            Self::On | Self::Off | Self::FaultPending | Self::FaultLatched => Self::FaultPending,
        }
    }

    /// The bridge acknowledged the shutoff command.
    #[must_use]
    pub fn shutoff_confirmed(self) -> Self {
        match self {
            Self::FaultPending => Self::FaultLatched,
            Self::On => Self::On,
            Self::Off => Self::Off,
            Self::FaultLatched => Self::FaultLatched,
        }
    }

    /// Operator acknowledged the fault. Only a confirmed latch may clear.
    pub fn fault_cleared(self) -> DomainResult<Self> {
        match self {
            Self::FaultLatched => Ok(Self::Off),
            Self::On => Ok(Self::On),
            Self::Off => Ok(Self::Off),
            Self::FaultPending => Err(DomainError::IllegalTransition {
                from: self.label().to_string(),
                action: "clear fault",
            }),
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_numbering() {
        assert_eq!(CircuitId::One.number(), 1);
        assert_eq!(CircuitId::from_number(2), Some(CircuitId::Two));
        assert_eq!(CircuitId::from_number(3), None);
        assert!(CircuitId::try_from(0).is_err());
        assert_eq!(CircuitId::Two.to_string(), "circuit-2");
    }

    #[test]
    fn test_circuit_id_serde_as_number() {
        let json = serde_json::to_string(&CircuitId::Two).unwrap();
        assert_eq!(json, "2");
        let parsed: CircuitId = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, CircuitId::One);
        assert!(serde_json::from_str::<CircuitId>("5").is_err());
    }

    #[test]
    fn test_default_is_off() {
        assert_eq!(CircuitState::default(), CircuitState::Off);
        assert!(!CircuitState::default().is_energized());
    }

    #[test]
    fn test_faulted_circuit_cannot_turn_on() {
        assert!(CircuitState::FaultPending.turn_on().is_err());
        assert!(CircuitState::FaultLatched.turn_on().is_err());
        assert_eq!(CircuitState::Off.turn_on(), Ok(CircuitState::On));
    }

    #[test]
    fn test_fault_lifecycle() {
        let state = CircuitState::On.fault_reported();
        assert_eq!(state, CircuitState::FaultPending);
        assert_eq!(state.turn_off(), CircuitState::FaultPending);
        assert!(state.fault_cleared().is_err());

        let state = state.shutoff_confirmed();
        assert_eq!(state, CircuitState::FaultLatched);
        assert_eq!(state.fault_cleared(), Ok(CircuitState::Off));
        assert_eq!(state.fault_reported(), CircuitState::FaultPending);
    }

    #[test]
    fn test_fault_side_codes() {
        assert_eq!(FaultSide::from_code(FaultSide::Load.code()), Some(FaultSide::Load));
        assert_eq!(FaultSide::from_code(9), None);
    }
}
