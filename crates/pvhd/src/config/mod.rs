//! Daemon configuration.
//!
//! Loaded from TOML at startup and hot-reloaded by [`watcher`]. Every section
//! has defaults so a file only needs the installation-specific parts
//! (sensors and tanks).
//!
//! Endpoint settings (`daemon.socket_path`, `satellite.bind`,
//! `satellite.peer`, `bridge.address`, `health.store_path`, `auth`) are read
//! once at startup. Everything else is picked up from the published
//! `Arc<DaemonConfig>` on reload.
//!
//! # Example
//!
//! ```toml
//! [[sensors]]
//! id = "tank1_top"
//! channel = 1
//! scale = 0.1
//! valid_min = -20.0
//! valid_max = 110.0
//!
//! [[tanks]]
//! id = "tank1"
//! sensor = "tank1_top"
//! circuit = 1
//! setpoint = 55.0
//! ```

pub mod watcher;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pvh_core::{CalibrationProfile, CircuitId, DomainError, SensorId, ValueRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use watcher::{reload_config, spawn_config_watcher};

/// Name of the configuration file inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "pvhotwater.toml";

/// Environment variable naming the configuration directory.
pub const CONFIG_DIR_ENV: &str = "PVHOTWATER_CONF_DIR";

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/pvhotwater/pvhd.sock";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub socket_path: PathBuf,
    /// How long shutdown waits for each task before aborting it.
    pub shutdown_grace_ms: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Local UDP address the satellite sends samples to.
    pub bind: SocketAddr,
    /// Satellite address relay commands are sent to.
    pub peer: SocketAddr,
    pub poll_interval_ms: u64,
    /// A sensor without a sample for this long reads STALE.
    pub sensor_timeout_ms: u64,
    /// Consecutive stale polls before a sensor is reported unavailable.
    pub retry_threshold: u32,
    /// Consecutive malformed frames before checksum failures are raised.
    pub checksum_failure_threshold: u32,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5601)),
            peer: SocketAddr::from(([127, 0, 0, 1], 5600)),
            poll_interval_ms: 1_000,
            sensor_timeout_ms: 5_000,
            retry_threshold: 3,
            checksum_failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// `host:port` of the exterior-panel bridge.
    pub address: String,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub connect_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5700".to_string(),
            heartbeat_interval_ms: 1_000,
            max_missed_heartbeats: 3,
            connect_timeout_ms: 2_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub evaluation_interval_ms: u64,
    /// No link report for this long counts as link loss.
    pub link_timeout_ms: u64,
    /// Upper bound on retained readings per sensor.
    pub history_capacity: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 250,
            link_timeout_ms: 3_000,
            history_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub retention_secs: u64,
    /// JSON-lines record file. Records stay in memory when unset.
    pub store_path: Option<PathBuf>,
    /// Capacity of the in-memory fallback ring.
    pub memory_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            retention_secs: 24 * 60 * 60,
            store_path: None,
            memory_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Hex SHA-256 digests of accepted operator tokens.
    pub token_sha256: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub channel: u8,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub valid_min: f64,
    pub valid_max: f64,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankConfig {
    pub id: String,
    /// Sensor driving the thermostat.
    pub sensor: String,
    pub circuit: u8,
    pub setpoint: f64,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
    /// Hard over-temperature limit.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: f64,
    #[serde(default = "default_setpoint_min")]
    pub setpoint_min: f64,
    #[serde(default = "default_setpoint_max")]
    pub setpoint_max: f64,
    #[serde(default = "default_max_heating")]
    pub max_heating_secs: u64,
    #[serde(default = "default_saturation_recovery")]
    pub saturation_recovery_secs: u64,
    #[serde(default = "default_fault_grace")]
    pub fault_grace_ms: u64,
}

fn default_hysteresis() -> f64 {
    2.0
}

fn default_hard_limit() -> f64 {
    85.0
}

fn default_setpoint_min() -> f64 {
    20.0
}

fn default_setpoint_max() -> f64 {
    75.0
}

fn default_max_heating() -> u64 {
    4 * 60 * 60
}

fn default_saturation_recovery() -> u64 {
    60 * 60
}

fn default_fault_grace() -> u64 {
    5_000
}

// ============================================================================
// Daemon Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub satellite: SatelliteConfig,
    pub bridge: BridgeConfig,
    pub safety: SafetyConfig,
    pub health: HealthConfig,
    pub auth: AuthConfig,
    pub sensors: Vec<SensorConfig>,
    pub tanks: Vec<TankConfig>,
}

impl DaemonConfig {
    /// Chooses the configuration file: the explicit path if given, else
    /// `$PVHOTWATER_CONF_DIR/pvhotwater.toml`, else `./pvhotwater.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(CONFIG_FILE_NAME),
            _ => PathBuf::from(CONFIG_FILE_NAME),
        }
    }

    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Like [`DaemonConfig::load`], without blocking the runtime thread.
    pub async fn load_async(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("satellite.poll_interval_ms", self.satellite.poll_interval_ms)?;
        positive("satellite.sensor_timeout_ms", self.satellite.sensor_timeout_ms)?;
        positive("satellite.retry_threshold", self.satellite.retry_threshold.into())?;
        positive(
            "satellite.checksum_failure_threshold",
            self.satellite.checksum_failure_threshold.into(),
        )?;
        positive("bridge.heartbeat_interval_ms", self.bridge.heartbeat_interval_ms)?;
        positive("bridge.max_missed_heartbeats", self.bridge.max_missed_heartbeats.into())?;
        positive("bridge.connect_timeout_ms", self.bridge.connect_timeout_ms)?;
        positive("bridge.backoff_initial_ms", self.bridge.backoff_initial_ms)?;
        if self.bridge.backoff_max_ms < self.bridge.backoff_initial_ms {
            return Err(ConfigError::invalid(
                "bridge.backoff_max_ms must not be below bridge.backoff_initial_ms",
            ));
        }
        if !(self.bridge.backoff_multiplier >= 1.0 && self.bridge.backoff_multiplier.is_finite()) {
            return Err(ConfigError::invalid("bridge.backoff_multiplier must be >= 1"));
        }
        positive("safety.evaluation_interval_ms", self.safety.evaluation_interval_ms)?;
        if self.safety.link_timeout_ms < self.bridge.heartbeat_interval_ms {
            return Err(ConfigError::invalid(
                "safety.link_timeout_ms must cover at least one heartbeat interval",
            ));
        }
        positive("safety.history_capacity", self.safety.history_capacity as u64)?;
        positive("health.interval_secs", self.health.interval_secs)?;
        positive("health.retention_secs", self.health.retention_secs)?;
        positive("health.memory_capacity", self.health.memory_capacity as u64)?;

        for digest in &self.auth.token_sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::invalid(
                    "auth.token_sha256 entries must be 64 hex characters",
                ));
            }
        }

        // Duplicate ids/channels and bad parameters are caught by the
        // calibration set itself.
        pvh_core::CalibrationSet::from_profiles(self.calibration_profiles())?;

        let sensors: HashSet<&str> = self.sensors.iter().map(|s| s.id.as_str()).collect();
        let mut tank_ids = HashSet::new();
        let mut circuits = HashSet::new();
        for tank in &self.tanks {
            if !tank_ids.insert(tank.id.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate tank {}", tank.id)));
            }
            if !sensors.contains(tank.sensor.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "tank {} references unknown sensor {}",
                    tank.id, tank.sensor
                )));
            }
            let circuit = CircuitId::try_from(tank.circuit)?;
            if !circuits.insert(circuit) {
                return Err(ConfigError::invalid(format!(
                    "{circuit} powers more than one tank"
                )));
            }
            tank.validate()?;
        }
        Ok(())
    }

    /// Calibration profiles as configured (all at version 1).
    pub fn calibration_profiles(&self) -> Vec<CalibrationProfile> {
        self.sensors
            .iter()
            .map(|s| {
                CalibrationProfile::new(
                    SensorId::new(s.id.clone()),
                    s.channel,
                    s.offset,
                    s.scale,
                    ValueRange::new(s.valid_min, s.valid_max),
                )
            })
            .collect()
    }

    /// True if a setting that is only read at startup changed.
    pub fn requires_restart(&self, other: &DaemonConfig) -> bool {
        self.daemon.socket_path != other.daemon.socket_path
            || self.satellite.bind != other.satellite.bind
            || self.satellite.peer != other.satellite.peer
            || self.bridge.address != other.bridge.address
            || self.health.store_path != other.health.store_path
            || self.auth != other.auth
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.satellite.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.bridge.heartbeat_interval_ms)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.safety.evaluation_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.health.retention_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.daemon.shutdown_grace_ms)
    }
}

impl TankConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("tanks.{}.{}", self.id, name);
        if !(self.hysteresis > 0.0 && self.hysteresis.is_finite()) {
            return Err(DomainError::invalid(field("hysteresis"), self.hysteresis, "> 0").into());
        }
        if !(self.setpoint_min < self.setpoint_max) {
            return Err(DomainError::invalid(
                field("setpoint_min"),
                self.setpoint_min,
                "below setpoint_max",
            )
            .into());
        }
        if !(self.setpoint >= self.setpoint_min && self.setpoint <= self.setpoint_max) {
            return Err(DomainError::invalid(
                field("setpoint"),
                self.setpoint,
                format!("within {}..={}", self.setpoint_min, self.setpoint_max),
            )
            .into());
        }
        if !(self.hard_limit > self.setpoint_max + self.hysteresis) {
            return Err(DomainError::invalid(
                field("hard_limit"),
                self.hard_limit,
                "above setpoint_max + hysteresis",
            )
            .into());
        }
        positive(&field("max_heating_secs"), self.max_heating_secs)?;
        Ok(())
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(DomainError::invalid(field, value, ">= 1").into())
    } else {
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid config: {0}")]
    Domain(#[from] DomainError),

    #[error("Failed to watch config: {0}")]
    Watch(#[from] notify::Error),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
