//! Sample table and poll logic, free of I/O.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvh_core::{CalibrationProfile, CalibrationSet, DomainResult, SensorId, SensorReading};
use pvh_protocol::{Decoded, SatelliteFrame};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;

/// Tunables taken from the `[satellite]` config section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HubSettings {
    pub sensor_timeout: Duration,
    pub retry_threshold: u32,
    pub checksum_failure_threshold: u32,
}

impl HubSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            sensor_timeout: Duration::from_millis(config.satellite.sensor_timeout_ms),
            retry_threshold: config.satellite.retry_threshold,
            checksum_failure_threshold: config.satellite.checksum_failure_threshold,
        }
    }
}

/// Output of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorBatch {
    pub readings: Vec<SensorReading>,
    /// Sensors whose failures exceeded the retry threshold.
    pub unavailable: BTreeSet<SensorId>,
    /// More consecutive malformed frames than the threshold.
    pub checksum_failures: bool,
}

#[derive(Debug, Clone, Copy)]
struct LatestSample {
    raw: f64,
    received_at: Instant,
    /// Not yet seen by a poll.
    unread: bool,
}

/// Normalizes satellite samples into calibrated readings.
#[derive(Debug)]
pub struct SensorHub {
    calibration: Arc<CalibrationSet>,
    settings: HubSettings,
    samples: HashMap<u8, LatestSample>,
    /// Consecutive failures (stale polls plus attributed bad frames).
    failures: HashMap<SensorId, u32>,
    consecutive_bad_frames: u32,
}

impl SensorHub {
    pub fn new(calibration: CalibrationSet, settings: HubSettings) -> Self {
        Self {
            calibration: Arc::new(calibration),
            settings,
            samples: HashMap::new(),
            failures: HashMap::new(),
            consecutive_bad_frames: 0,
        }
    }

    pub fn calibration(&self) -> Arc<CalibrationSet> {
        Arc::clone(&self.calibration)
    }

    pub fn set_settings(&mut self, settings: HubSettings) {
        self.settings = settings;
    }

    /// Publishes a new calibration set. Profiles whose parameters changed get
    /// a new version; readings already produced keep the version they used.
    pub fn update_calibration(&mut self, profiles: Vec<CalibrationProfile>) -> DomainResult<()> {
        let next = self.calibration.successor(profiles)?;
        for profile in next.iter() {
            let changed = self
                .calibration
                .get(&profile.sensor_id)
                .map_or(true, |prev| prev.version != profile.version);
            if changed {
                info!(
                    sensor = %profile.sensor_id,
                    version = profile.version,
                    "Calibration profile updated"
                );
            }
        }
        self.calibration = Arc::new(next);
        Ok(())
    }

    /// Feeds one decoded satellite item into the sample table.
    pub fn ingest(&mut self, item: Decoded<SatelliteFrame>, now: Instant) {
        match item {
            Decoded::Frame(SatelliteFrame::Sample { channel, value }) => {
                self.consecutive_bad_frames = 0;
                if self.calibration.by_channel(channel).is_none() {
                    debug!(channel, "Sample for unconfigured channel ignored");
                    return;
                }
                self.samples.insert(
                    channel,
                    LatestSample {
                        raw: f64::from(value),
                        received_at: now,
                        unread: true,
                    },
                );
            }
            Decoded::Frame(SatelliteFrame::Relay { circuit, .. }) => {
                self.consecutive_bad_frames = 0;
                debug!(circuit, "Ignoring relay frame echoed by satellite");
            }
            Decoded::Rejected { error, channel } => {
                self.consecutive_bad_frames = self.consecutive_bad_frames.saturating_add(1);
                let sensor = channel
                    .and_then(|c| self.calibration.by_channel(c))
                    .map(|profile| profile.sensor_id.clone());
                debug!(error = %error, sensor = ?sensor, "Dropped malformed satellite frame");
                if let Some(sensor) = sensor {
                    let count = self.failures.entry(sensor).or_insert(0);
                    *count = count.saturating_add(1);
                }
            }
        }
    }

    /// Converts the sample table into readings.
    ///
    /// The calibration snapshot is taken once; a concurrent update only
    /// affects the next poll.
    pub fn poll(&mut self, now: Instant, wall: DateTime<Utc>) -> SensorBatch {
        let calibration = Arc::clone(&self.calibration);
        let mut batch = SensorBatch::default();

        for profile in calibration.iter() {
            let sample = self.samples.get_mut(&profile.channel).map(|s| {
                let seen = *s;
                s.unread = false;
                seen
            });
            let reading = match sample {
                Some(s) if now.saturating_duration_since(s.received_at) <= self.settings.sensor_timeout => {
                    SensorReading::from_sample(profile, s.raw, wall)
                }
                _ => SensorReading::timed_out(profile, sample.map(|s| s.raw), wall),
            };

            // Only a sample received since the last poll ends a failure streak;
            // bad frames attributed in between keep counting.
            let count = self.failures.entry(profile.sensor_id.clone()).or_insert(0);
            if reading.is_fresh() {
                if sample.map_or(false, |s| s.unread) {
                    *count = 0;
                }
            } else {
                *count = count.saturating_add(1);
                debug!(
                    sensor = %profile.sensor_id,
                    reason = ?reading.stale_reason(),
                    consecutive = *count,
                    "Stale reading"
                );
            }
            if *count > self.settings.retry_threshold {
                batch.unavailable.insert(profile.sensor_id.clone());
            }

            batch.readings.push(reading);
        }

        // Forget failure counts of sensors that were removed from the config.
        self.failures
            .retain(|sensor, _| calibration.get(sensor).is_some());

        batch.checksum_failures =
            self.consecutive_bad_frames > self.settings.checksum_failure_threshold;
        if batch.checksum_failures {
            warn!(
                consecutive = self.consecutive_bad_frames,
                "Repeated satellite frame failures"
            );
        }

        batch
    }
}
