//! Versioned calibration profiles.
//!
//! A `CalibrationSet` is an immutable snapshot. Profiles are shared through
//! `Arc`, so a poll cycle that grabbed the set keeps using the versions it
//! started with even if a reload publishes a successor set meanwhile.

use crate::error::{DomainError, DomainResult};
use crate::sensor::SensorId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Inclusive range of physically plausible calibrated values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Returns true if the value is finite and inside the range.
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Linear calibration for one sensor: `calibrated = raw * scale + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub sensor_id: SensorId,
    /// Satellite channel that carries this sensor's samples.
    pub channel: u8,
    pub offset: f64,
    pub scale: f64,
    pub valid_range: ValueRange,
    pub version: u32,
}

impl CalibrationProfile {
    /// Creates a first-version profile.
    pub fn new(
        sensor_id: SensorId,
        channel: u8,
        offset: f64,
        scale: f64,
        valid_range: ValueRange,
    ) -> Self {
        Self {
            sensor_id,
            channel,
            offset,
            scale,
            valid_range,
            version: 1,
        }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// True if both profiles would calibrate identically.
    pub fn same_parameters(&self, other: &CalibrationProfile) -> bool {
        self.channel == other.channel
            && self.offset == other.offset
            && self.scale == other.scale
            && self.valid_range == other.valid_range
    }

    /// Checks that the profile can produce meaningful values.
    pub fn validate(&self) -> DomainResult<()> {
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(DomainError::invalid(
                format!("scale of {}", self.sensor_id),
                self.scale,
                "finite and non-zero",
            ));
        }
        if !self.offset.is_finite() {
            return Err(DomainError::invalid(
                format!("offset of {}", self.sensor_id),
                self.offset,
                "finite",
            ));
        }
        if !(self.valid_range.min < self.valid_range.max) {
            return Err(DomainError::invalid(
                format!("valid range of {}", self.sensor_id),
                format!("{}..{}", self.valid_range.min, self.valid_range.max),
                "min < max",
            ));
        }
        Ok(())
    }
}

/// Immutable snapshot of every active calibration profile.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    profiles: BTreeMap<SensorId, Arc<CalibrationProfile>>,
    by_channel: HashMap<u8, SensorId>,
}

impl CalibrationSet {
    /// Builds a set of first-version profiles.
    ///
    /// # Errors
    ///
    /// Fails on invalid profiles or duplicate sensor ids / channels.
    pub fn from_profiles(profiles: Vec<CalibrationProfile>) -> DomainResult<Self> {
        let mut set = Self::default();
        for profile in profiles {
            set.insert(profile)?;
        }
        Ok(set)
    }

    /// Builds the set that replaces `self` after a configuration change.
    ///
    /// A profile keeps its version when its parameters are unchanged and
    /// gets `previous + 1` otherwise. New sensors start at version 1.
    pub fn successor(&self, profiles: Vec<CalibrationProfile>) -> DomainResult<Self> {
        let mut next = Self::default();
        for mut profile in profiles {
            profile.version = match self.profiles.get(&profile.sensor_id) {
                Some(prev) if prev.same_parameters(&profile) => prev.version,
                Some(prev) => {
                    debug!(
                        sensor = %profile.sensor_id,
                        version = prev.version.saturating_add(1),
                        "Calibration profile changed"
                    );
                    prev.version.saturating_add(1)
                }
                None => 1,
            };
            next.insert(profile)?;
        }
        Ok(next)
    }

    fn insert(&mut self, profile: CalibrationProfile) -> DomainResult<()> {
        profile.validate()?;
        if self.profiles.contains_key(&profile.sensor_id) {
            return Err(DomainError::DuplicateSensor(profile.sensor_id.to_string()));
        }
        if self.by_channel.contains_key(&profile.channel) {
            return Err(DomainError::DuplicateChannel(profile.channel));
        }
        self.by_channel
            .insert(profile.channel, profile.sensor_id.clone());
        self.profiles
            .insert(profile.sensor_id.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn get(&self, sensor_id: &SensorId) -> Option<&Arc<CalibrationProfile>> {
        self.profiles.get(sensor_id)
    }

    pub fn by_channel(&self, channel: u8) -> Option<&Arc<CalibrationProfile>> {
        self.by_channel
            .get(&channel)
            .and_then(|id| self.profiles.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CalibrationProfile>> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
