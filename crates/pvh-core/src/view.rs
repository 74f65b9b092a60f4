//! Read-only snapshot of the daemon state for clients.

use crate::alarm::{AlarmEvent, AlarmLevel};
use crate::circuit::{CircuitId, CircuitState};
use crate::health::SubsystemStatus;
use crate::link::LinkState;
use crate::sensor::{SensorId, SensorReading};
use crate::tank::{TankId, ThermostatState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitView {
    pub circuit: CircuitId,
    pub state: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankView {
    pub tank: TankId,
    pub sensor: SensorId,
    pub circuit: CircuitId,
    pub setpoint: f64,
    pub hysteresis: f64,
    pub thermostat: ThermostatState,
    /// Latest usable temperature, if the driving sensor is fresh.
    pub temperature: Option<f64>,
}

/// Everything a client needs to render the system state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub alarm_level: AlarmLevel,
    pub circuits: Vec<CircuitView>,
    pub tanks: Vec<TankView>,
    pub link: LinkState,
    pub alarms: Vec<AlarmEvent>,
    pub sensors: Vec<SensorReading>,
    pub subsystems: BTreeMap<String, SubsystemStatus>,
    pub uptime_secs: u64,
}

impl SystemSnapshot {
    pub fn circuit_state(&self, circuit: CircuitId) -> Option<CircuitState> {
        self.circuits
            .iter()
            .find(|view| view.circuit == circuit)
            .map(|view| view.state)
    }

    pub fn tank(&self, tank: &TankId) -> Option<&TankView> {
        self.tanks.iter().find(|view| &view.tank == tank)
    }
}

/// State-change notification published by the safety monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    CircuitChanged {
        circuit: CircuitId,
        from: CircuitState,
        to: CircuitState,
    },
    AlarmLevelChanged {
        from: AlarmLevel,
        to: AlarmLevel,
    },
    AlarmRaised {
        alarm: AlarmEvent,
    },
    AlarmCleared {
        alarm: AlarmEvent,
    },
    LinkChanged {
        from: LinkState,
        to: LinkState,
    },
    ThermostatChanged {
        tank: TankId,
        from: ThermostatState,
        to: ThermostatState,
    },
    SetpointChanged {
        tank: TankId,
        setpoint: f64,
    },
}
