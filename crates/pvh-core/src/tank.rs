//! Tank identity and thermostat state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configured name of a hot-water tank (e.g., "tank1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TankId(String);

impl TankId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TankId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TankId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-tank thermostat state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatState {
    #[default]
    Idle,
    Heating,
    /// Heated too long without reaching the upper band edge.
    Saturated,
    /// The driving sensor is stale or missing.
    Fault,
}

impl ThermostatState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Heating => "heating",
            Self::Saturated => "saturated",
            Self::Fault => "fault",
        }
    }

    /// Whether the thermostat wants the tank's heater energized.
    #[must_use]
    pub fn demands_heat(&self) -> bool {
        matches!(self, Self::Heating)
    }
}

impl fmt::Display for ThermostatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
