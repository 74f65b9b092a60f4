//! GFCI bridge link state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of the heartbeat link to the exterior-panel bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Connecting,
    Up,
    /// At least one heartbeat missed, below the loss threshold.
    Degraded,
    Down,
}

impl LinkState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    /// Only an UP link permits energizing a circuit.
    #[must_use]
    pub fn permits_power(&self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
