//! Per-tank hysteresis control.
//!
//! ```text
//!            t <= target - h                  t >= target + h
//!   IDLE ──────────────────────▶ HEATING ──────────────────────▶ IDLE
//!                                   │
//!                                   │ heating longer than max_heating
//!                                   ▼
//!                               SATURATED ──(ack or recovery)──▶ IDLE
//!
//!   any state ──(reading stale/missing)──▶ FAULT ──(fresh for fault_grace)──▶ IDLE
//! ```
//!
//! Band edges are inclusive. Nothing changes strictly inside the band.

use std::time::Duration;

use pvh_core::{CircuitId, SensorId, SensorReading, TankId, ThermostatState};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::ThermostatError;
use crate::config::TankConfig;

/// Static parameters of one tank.
#[derive(Debug, Clone, PartialEq)]
pub struct TankSettings {
    pub tank: TankId,
    pub sensor: SensorId,
    pub circuit: CircuitId,
    pub setpoint: f64,
    pub hysteresis: f64,
    pub setpoint_min: f64,
    pub setpoint_max: f64,
    pub max_heating: Duration,
    pub saturation_recovery: Duration,
    pub fault_grace: Duration,
}

impl TankSettings {
    /// Returns `None` for an invalid circuit number, which config
    /// validation already rejects.
    pub fn from_config(tank: &TankConfig) -> Option<Self> {
        Some(Self {
            tank: TankId::new(tank.id.clone()),
            sensor: SensorId::new(tank.sensor.clone()),
            circuit: CircuitId::from_number(tank.circuit)?,
            setpoint: tank.setpoint,
            hysteresis: tank.hysteresis,
            setpoint_min: tank.setpoint_min,
            setpoint_max: tank.setpoint_max,
            max_heating: Duration::from_secs(tank.max_heating_secs),
            saturation_recovery: Duration::from_secs(tank.saturation_recovery_secs),
            fault_grace: Duration::from_millis(tank.fault_grace_ms),
        })
    }
}

/// What the thermostat asks the safety monitor to do for one tank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatProposal {
    pub tank: TankId,
    pub sensor: SensorId,
    pub circuit: CircuitId,
    pub state: ThermostatState,
    pub heat: bool,
    pub setpoint: f64,
    pub hysteresis: f64,
    pub temperature: Option<f64>,
}

/// Thermostat for a single tank.
#[derive(Debug, Clone)]
pub struct TankThermostat {
    settings: TankSettings,
    /// Setpoint from the config file; `settings.setpoint` may differ after
    /// an operator change.
    configured_setpoint: f64,
    state: ThermostatState,
    heating_since: Option<Instant>,
    saturated_since: Option<Instant>,
    fresh_since: Option<Instant>,
    temperature: Option<f64>,
}

impl TankThermostat {
    pub fn new(settings: TankSettings) -> Self {
        Self {
            configured_setpoint: settings.setpoint,
            settings,
            state: ThermostatState::Idle,
            heating_since: None,
            saturated_since: None,
            fresh_since: None,
            temperature: None,
        }
    }

    pub fn settings(&self) -> &TankSettings {
        &self.settings
    }

    pub fn state(&self) -> ThermostatState {
        self.state
    }

    /// Replaces the tank parameters after a config reload. The current
    /// state is kept, and so is an operator setpoint unless the configured
    /// setpoint itself changed or the new bounds exclude it.
    pub fn apply_settings(&mut self, mut settings: TankSettings) {
        let runtime = self.settings.setpoint;
        let configured = settings.setpoint;
        let in_bounds = runtime >= settings.setpoint_min && runtime <= settings.setpoint_max;
        if configured == self.configured_setpoint && in_bounds {
            settings.setpoint = runtime;
        } else if runtime != configured {
            info!(
                tank = %settings.tank,
                from = runtime,
                to = configured,
                "Configured setpoint replaces operator setpoint"
            );
        }
        self.configured_setpoint = configured;
        self.settings = settings;
    }

    /// Applies a setpoint requested by an operator.
    pub fn set_setpoint(&mut self, value: f64) -> Result<(), ThermostatError> {
        let s = &self.settings;
        if !(value.is_finite() && value >= s.setpoint_min && value <= s.setpoint_max) {
            return Err(ThermostatError::SetpointOutOfRange {
                tank: s.tank.clone(),
                value,
                min: s.setpoint_min,
                max: s.setpoint_max,
            });
        }
        info!(tank = %s.tank, from = s.setpoint, to = value, "Setpoint changed");
        self.settings.setpoint = value;
        Ok(())
    }

    /// Leaves SATURATED after an operator acknowledgment.
    pub fn acknowledge_saturation(&mut self) -> bool {
        if self.state == ThermostatState::Saturated {
            info!(tank = %self.settings.tank, "Saturation acknowledged");
            self.enter(ThermostatState::Idle);
            true
        } else {
            false
        }
    }

    /// Advances the state machine with the latest reading of the driving
    /// sensor. Returns the transition, if any.
    pub fn update(
        &mut self,
        reading: Option<&SensorReading>,
        now: Instant,
    ) -> Option<(ThermostatState, ThermostatState)> {
        let from = self.state;
        let temperature = reading.and_then(SensorReading::usable_value);
        self.temperature = temperature;

        let Some(t) = temperature else {
            self.fresh_since = None;
            if from != ThermostatState::Fault {
                warn!(
                    tank = %self.settings.tank,
                    sensor = %self.settings.sensor,
                    "Driving sensor not fresh, thermostat in fault"
                );
                self.enter(ThermostatState::Fault);
            }
            return self.transition(from);
        };

        let low = self.settings.setpoint - self.settings.hysteresis;
        let high = self.settings.setpoint + self.settings.hysteresis;

        match from {
            ThermostatState::Fault => {
                let since = *self.fresh_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.settings.fault_grace {
                    self.enter(ThermostatState::Idle);
                }
            }
            ThermostatState::Saturated => {
                let since = self.saturated_since.unwrap_or(now);
                if now.saturating_duration_since(since) >= self.settings.saturation_recovery {
                    info!(tank = %self.settings.tank, "Saturation recovery elapsed");
                    self.enter(ThermostatState::Idle);
                }
            }
            ThermostatState::Idle => {
                if t <= low {
                    self.enter(ThermostatState::Heating);
                    self.heating_since = Some(now);
                }
            }
            ThermostatState::Heating => {
                let since = self.heating_since.unwrap_or(now);
                if t >= high {
                    self.enter(ThermostatState::Idle);
                } else if now.saturating_duration_since(since) > self.settings.max_heating {
                    warn!(
                        tank = %self.settings.tank,
                        temperature = t,
                        "Heating saturated without reaching the upper band edge"
                    );
                    self.enter(ThermostatState::Saturated);
                    self.saturated_since = Some(now);
                }
            }
        }

        self.transition(from)
    }

    pub fn proposal(&self) -> HeatProposal {
        HeatProposal {
            tank: self.settings.tank.clone(),
            sensor: self.settings.sensor.clone(),
            circuit: self.settings.circuit,
            state: self.state,
            heat: self.state.demands_heat(),
            setpoint: self.settings.setpoint,
            hysteresis: self.settings.hysteresis,
            temperature: self.temperature,
        }
    }

    fn enter(&mut self, state: ThermostatState) {
        if state != ThermostatState::Heating {
            self.heating_since = None;
        }
        if state != ThermostatState::Saturated {
            self.saturated_since = None;
        }
        self.state = state;
    }

    fn transition(&self, from: ThermostatState) -> Option<(ThermostatState, ThermostatState)> {
        (from != self.state).then_some((from, self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pvh_core::{CalibrationProfile, ValueRange};

    fn settings() -> TankSettings {
        TankSettings {
            tank: TankId::new("tank1"),
            sensor: SensorId::new("t1"),
            circuit: CircuitId::One,
            setpoint: 50.0,
            hysteresis: 2.0,
            setpoint_min: 30.0,
            setpoint_max: 70.0,
            max_heating: Duration::from_secs(3600),
            saturation_recovery: Duration::from_secs(600),
            fault_grace: Duration::from_secs(5),
        }
    }

    fn profile() -> CalibrationProfile {
        CalibrationProfile::new(SensorId::new("t1"), 1, 0.0, 1.0, ValueRange::new(-20.0, 110.0))
    }

    fn fresh(t: f64) -> SensorReading {
        SensorReading::from_sample(&profile(), t, Utc::now())
    }

    fn stale() -> SensorReading {
        SensorReading::timed_out(&profile(), Some(50.0), Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_sequence_does_not_chatter() {
        let mut thermostat = TankThermostat::new(settings());
        let now = Instant::now();

        let states: Vec<ThermostatState> = [48.0, 49.0, 47.0, 52.0, 53.0, 49.0]
            .into_iter()
            .map(|t| {
                thermostat.update(Some(&fresh(t)), now);
                thermostat.state()
            })
            .collect();

        use ThermostatState::{Heating, Idle};
        assert_eq!(states, vec![Heating, Heating, Heating, Idle, Idle, Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inside_band_stays_idle() {
        let mut thermostat = TankThermostat::new(settings());
        assert_eq!(thermostat.update(Some(&fresh(48.1)), Instant::now()), None);
        assert_eq!(thermostat.state(), ThermostatState::Idle);
        assert!(!thermostat.proposal().heat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reading_faults_and_recovers_after_grace() {
        let mut thermostat = TankThermostat::new(settings());
        let start = Instant::now();
        thermostat.update(Some(&fresh(40.0)), start);
        assert_eq!(thermostat.state(), ThermostatState::Heating);

        let change = thermostat.update(Some(&stale()), start);
        assert_eq!(change, Some((ThermostatState::Heating, ThermostatState::Fault)));
        assert!(!thermostat.proposal().heat);

        thermostat.update(Some(&fresh(40.0)), start + Duration::from_secs(1));
        assert_eq!(thermostat.state(), ThermostatState::Fault);
        thermostat.update(Some(&fresh(40.0)), start + Duration::from_secs(6));
        assert_eq!(thermostat.state(), ThermostatState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reading_is_fault() {
        let mut thermostat = TankThermostat::new(settings());
        thermostat.update(None, Instant::now());
        assert_eq!(thermostat.state(), ThermostatState::Fault);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_and_acknowledgment() {
        let mut thermostat = TankThermostat::new(settings());
        let start = Instant::now();
        thermostat.update(Some(&fresh(40.0)), start);
        thermostat.update(Some(&fresh(45.0)), start + Duration::from_secs(3601));
        assert_eq!(thermostat.state(), ThermostatState::Saturated);
        assert!(!thermostat.proposal().heat);

        // Still saturated even though the temperature would call for heat.
        thermostat.update(Some(&fresh(40.0)), start + Duration::from_secs(3700));
        assert_eq!(thermostat.state(), ThermostatState::Saturated);

        assert!(thermostat.acknowledge_saturation());
        assert_eq!(thermostat.state(), ThermostatState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_recovers_after_timeout() {
        let mut thermostat = TankThermostat::new(settings());
        let start = Instant::now();
        thermostat.update(Some(&fresh(40.0)), start);
        thermostat.update(Some(&fresh(45.0)), start + Duration::from_secs(3601));
        thermostat.update(Some(&fresh(45.0)), start + Duration::from_secs(4201));
        assert_eq!(thermostat.state(), ThermostatState::Idle);
    }

    #[test]
    fn test_setpoint_bounds() {
        let mut thermostat = TankThermostat::new(settings());
        assert!(thermostat.set_setpoint(55.0).is_ok());
        assert_eq!(thermostat.settings().setpoint, 55.0);
        assert!(matches!(
            thermostat.set_setpoint(90.0),
            Err(ThermostatError::SetpointOutOfRange { .. })
        ));
        assert!(thermostat.set_setpoint(f64::NAN).is_err());
        assert_eq!(thermostat.settings().setpoint, 55.0);
    }

    #[test]
    fn test_reload_keeps_operator_setpoint() {
        let mut thermostat = TankThermostat::new(settings());
        thermostat.set_setpoint(60.0).unwrap();

        let mut reloaded = settings();
        reloaded.hysteresis = 3.0;
        thermostat.apply_settings(reloaded);
        assert_eq!(thermostat.settings().setpoint, 60.0);
        assert_eq!(thermostat.settings().hysteresis, 3.0);
    }

    #[test]
    fn test_reload_with_changed_setpoint_wins() {
        let mut thermostat = TankThermostat::new(settings());
        thermostat.set_setpoint(60.0).unwrap();

        let mut reloaded = settings();
        reloaded.setpoint = 45.0;
        thermostat.apply_settings(reloaded);
        assert_eq!(thermostat.settings().setpoint, 45.0);

        // The new configured value is the baseline for the next reload.
        thermostat.set_setpoint(65.0).unwrap();
        let mut again = settings();
        again.setpoint = 45.0;
        thermostat.apply_settings(again);
        assert_eq!(thermostat.settings().setpoint, 65.0);
    }

    #[test]
    fn test_reload_drops_operator_setpoint_outside_new_bounds() {
        let mut thermostat = TankThermostat::new(settings());
        thermostat.set_setpoint(68.0).unwrap();

        let mut reloaded = settings();
        reloaded.setpoint_max = 60.0;
        thermostat.apply_settings(reloaded);
        assert_eq!(thermostat.settings().setpoint, 50.0);
    }
}
