//! Subsystem liveness and health records.

use crate::alarm::AlarmLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Periodic subsystems whose liveness is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    SensorHub,
    GfciLink,
    Thermostat,
    SafetyMonitor,
    HealthRecorder,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::SensorHub,
        Subsystem::GfciLink,
        Subsystem::Thermostat,
        Subsystem::SafetyMonitor,
        Subsystem::HealthRecorder,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SensorHub => "sensor_hub",
            Self::GfciLink => "gfci_link",
            Self::Thermostat => "thermostat",
            Self::SafetyMonitor => "safety_monitor",
            Self::HealthRecorder => "health_recorder",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Liveness of one subsystem at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    pub uptime_secs: u64,
    /// Time since the last report (since start if it never reported).
    pub last_report_age_ms: u64,
    /// Number of reports received.
    pub counter: u64,
    pub expected_interval_ms: u64,
}

impl SubsystemStatus {
    /// A subsystem is fresh while its last report is younger than twice its
    /// expected reporting interval.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.last_report_age_ms < self.expected_interval_ms.saturating_mul(2)
    }
}

/// Healthy = not CRITICAL and every subsystem fresh.
#[must_use]
pub fn is_healthy<'a>(
    level: AlarmLevel,
    subsystems: impl IntoIterator<Item = &'a SubsystemStatus>,
) -> bool {
    level != AlarmLevel::Critical && subsystems.into_iter().all(SubsystemStatus::is_fresh)
}

/// Periodic health snapshot, retained for the retention horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub overall_uptime_secs: u64,
    pub subsystems: BTreeMap<String, SubsystemStatus>,
    /// True when any alarm is raised (level above NORMAL).
    pub alarm_flag: bool,
    pub alarm_level: AlarmLevel,
    pub healthy: bool,
    pub summary: String,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub cpu_percent: f32,
    /// The record could not be written to the persistent store.
    #[serde(default)]
    pub store_degraded: bool,
}

/// Answer to a health query: the live verdict plus recent records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub alarm_level: AlarmLevel,
    pub summary: String,
    pub subsystems: BTreeMap<String, SubsystemStatus>,
    #[serde(default)]
    pub records: Vec<HealthRecord>,
}
