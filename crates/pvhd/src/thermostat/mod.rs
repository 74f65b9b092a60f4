//! Thermostat controller.
//!
//! Proposes heat for each tank from its driving sensor. Never actuates a
//! relay; the safety monitor decides.

use std::sync::Arc;

use pvh_core::{SensorReading, TankId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod actor;
mod controller;

pub use actor::{ThermostatActor, ThermostatCommand};
pub use controller::{HeatProposal, TankSettings, TankThermostat};

use crate::config::DaemonConfig;
use crate::safety::SafetyHandle;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ThermostatError {
    #[error("Unknown tank: {0}")]
    UnknownTank(TankId),

    #[error("Setpoint {value} for {tank} outside [{min}, {max}]")]
    SetpointOutOfRange {
        tank: TankId,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Thermostat channel closed")]
    ChannelClosed,
}

/// Cheap-to-clone handle to the thermostat actor.
#[derive(Clone)]
pub struct ThermostatHandle {
    sender: mpsc::Sender<ThermostatCommand>,
}

impl ThermostatHandle {
    pub fn new(sender: mpsc::Sender<ThermostatCommand>) -> Self {
        Self { sender }
    }

    pub async fn readings(&self, readings: Vec<SensorReading>) -> Result<(), ThermostatError> {
        self.sender
            .send(ThermostatCommand::Readings(readings))
            .await
            .map_err(|_| ThermostatError::ChannelClosed)
    }

    /// Changes the setpoint of a tank.
    ///
    /// # Errors
    ///
    /// - `ThermostatError::UnknownTank` if the tank is not configured
    /// - `ThermostatError::SetpointOutOfRange` if outside the tank's bounds
    /// - `ThermostatError::ChannelClosed` if the actor has shut down
    pub async fn set_setpoint(&self, tank: TankId, value: f64) -> Result<(), ThermostatError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ThermostatCommand::SetSetpoint {
                tank,
                value,
                respond_to: tx,
            })
            .await
            .map_err(|_| ThermostatError::ChannelClosed)?;
        rx.await.map_err(|_| ThermostatError::ChannelClosed)?
    }

    pub async fn proposals(&self) -> Result<Vec<HeatProposal>, ThermostatError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ThermostatCommand::GetProposals { respond_to: tx })
            .await
            .map_err(|_| ThermostatError::ChannelClosed)?;
        rx.await.map_err(|_| ThermostatError::ChannelClosed)
    }
}

/// Spawns the thermostat actor.
pub fn spawn_thermostat(
    safety: SafetyHandle,
    saturation_acks: mpsc::UnboundedReceiver<TankId>,
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> (ThermostatHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = ThermostatActor::new(rx, saturation_acks, safety, config, cancel_token);
    let join = tokio::spawn(actor.run());
    (ThermostatHandle::new(tx), join)
}
