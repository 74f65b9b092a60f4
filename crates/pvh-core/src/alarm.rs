//! Alarm levels and events.

use crate::circuit::{CircuitId, FaultSide};
use crate::sensor::SensorId;
use crate::tank::TankId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall alarm level. Ordered: `Normal < Warning < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl AlarmLevel {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Monotonic identifier of an alarm event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmEventId(pub u64);

impl fmt::Display for AlarmEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The condition that raised an alarm.
///
/// At most one event exists per cause at a time; two causes are the same
/// when they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlarmCause {
    LinkDown,
    LinkDegraded,
    /// The link monitor stopped reporting.
    LinkSilent,
    SensorUnavailable { sensor: SensorId },
    /// A tank's driving sensor has no usable current reading.
    SensorStale { sensor: SensorId },
    ChecksumFailures,
    GroundFault { circuit: CircuitId, side: FaultSide },
    OverTemperature { tank: TankId },
    HeatingSaturated { tank: TankId },
}

impl AlarmCause {
    /// Severity this cause contributes to the overall level.
    #[must_use]
    pub fn level(&self) -> AlarmLevel {
        match self {
            Self::LinkDown
            | Self::LinkSilent
            | Self::GroundFault { .. }
            | Self::OverTemperature { .. } => AlarmLevel::Critical,
            Self::LinkDegraded
            | Self::SensorUnavailable { .. }
            | Self::SensorStale { .. }
            | Self::ChecksumFailures
            | Self::HeatingSaturated { .. } => AlarmLevel::Warning,
        }
    }

    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::LinkDown => "GFCI bridge link down".to_string(),
            Self::LinkDegraded => "GFCI bridge heartbeat missed".to_string(),
            Self::LinkSilent => "GFCI link monitor stopped reporting".to_string(),
            Self::SensorUnavailable { sensor } => format!("sensor {sensor} unavailable"),
            Self::SensorStale { sensor } => format!("sensor {sensor} reading stale"),
            Self::ChecksumFailures => "repeated satellite checksum failures".to_string(),
            Self::GroundFault { circuit, side } => {
                format!("ground fault on {circuit} ({side} side)")
            }
            Self::OverTemperature { tank } => format!("{tank} over temperature limit"),
            Self::HeatingSaturated { tank } => format!("{tank} heating saturated"),
        }
    }
}

impl fmt::Display for AlarmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A raised alarm.
///
/// `active` tracks whether the condition still holds. The event may be
/// removed only once it is both acknowledged and inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: AlarmEventId,
    pub timestamp: DateTime<Utc>,
    pub cause: AlarmCause,
    pub level: AlarmLevel,
    pub acknowledged: bool,
    pub active: bool,
}

impl AlarmEvent {
    pub fn raise(id: AlarmEventId, cause: AlarmCause, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            timestamp,
            level: cause.level(),
            cause,
            acknowledged: false,
            active: true,
        }
    }

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    /// The condition came back. A previous acknowledgment no longer counts.
    pub fn recur(&mut self, timestamp: DateTime<Utc>) {
        if !self.active || self.acknowledged {
            self.timestamp = timestamp;
        }
        self.active = true;
        self.acknowledged = false;
    }

    #[must_use]
    pub fn is_clearable(&self) -> bool {
        self.acknowledged && !self.active
    }
}
