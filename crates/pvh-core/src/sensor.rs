//! Sensor identities and readings.

use crate::calibration::CalibrationProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Configured name of a sensor (e.g., "tank1_top").
///
/// The satellite only knows channel numbers; the calibration profile maps a
/// channel to this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl SensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SensorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SensorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Validity
// ============================================================================

/// Whether a reading can be trusted for control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Fresh,
    Stale,
}

/// Why a reading was flagged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// No sample arrived within the sensor timeout.
    Timeout,
    /// The calibrated value fell outside the profile's valid range.
    OutOfRange,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::OutOfRange => write!(f, "out of range"),
        }
    }
}

// ============================================================================
// Sensor Reading
// ============================================================================

/// A single calibrated sensor reading.
///
/// Readings are immutable: all fields are private and set once by the
/// constructors, which apply calibration exactly once with the profile
/// passed in. The profile version is recorded so a reading can always be
/// traced back to the calibration that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    sensor_id: SensorId,
    raw_value: Option<f64>,
    calibrated_value: Option<f64>,
    timestamp: DateTime<Utc>,
    validity: Validity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stale_reason: Option<StaleReason>,
    profile_version: u32,
}

impl SensorReading {
    /// Builds a reading from a freshly received raw sample.
    ///
    /// Values whose calibrated form falls outside the valid range (or is not
    /// finite) are kept but flagged stale.
    pub fn from_sample(profile: &CalibrationProfile, raw: f64, timestamp: DateTime<Utc>) -> Self {
        let calibrated = profile.apply(raw);
        let in_range = profile.valid_range.contains(calibrated);

        Self {
            sensor_id: profile.sensor_id.clone(),
            raw_value: Some(raw),
            calibrated_value: Some(calibrated),
            timestamp,
            validity: if in_range { Validity::Fresh } else { Validity::Stale },
            stale_reason: if in_range { None } else { Some(StaleReason::OutOfRange) },
            profile_version: profile.version,
        }
    }

    /// Builds a stale reading for a sensor that did not report in time.
    ///
    /// Carries the last-known raw value (calibrated with the given profile)
    /// if one exists. Never invents a value.
    pub fn timed_out(
        profile: &CalibrationProfile,
        last_raw: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: profile.sensor_id.clone(),
            raw_value: last_raw,
            calibrated_value: last_raw.map(|raw| profile.apply(raw)),
            timestamp,
            validity: Validity::Stale,
            stale_reason: Some(StaleReason::Timeout),
            profile_version: profile.version,
        }
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    pub fn raw_value(&self) -> Option<f64> {
        self.raw_value
    }

    pub fn calibrated_value(&self) -> Option<f64> {
        self.calibrated_value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn stale_reason(&self) -> Option<StaleReason> {
        self.stale_reason
    }

    pub fn profile_version(&self) -> u32 {
        self.profile_version
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.validity == Validity::Fresh
    }

    /// Returns the calibrated value only if the reading is fresh.
    ///
    /// Control decisions must go through this accessor.
    pub fn usable_value(&self) -> Option<f64> {
        if self.is_fresh() {
            self.calibrated_value
        } else {
            None
        }
    }
}
