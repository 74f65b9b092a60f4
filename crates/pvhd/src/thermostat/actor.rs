//! Thermostat actor: runs one [`TankThermostat`] per configured tank and
//! forwards heat proposals to the safety monitor.

use std::collections::BTreeMap;
use std::sync::Arc;

use pvh_core::{SensorReading, TankId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{HeatProposal, TankSettings, TankThermostat};
use super::ThermostatError;
use crate::config::DaemonConfig;
use crate::safety::SafetyHandle;

#[derive(Debug)]
pub enum ThermostatCommand {
    /// Latest readings from one sensor hub poll.
    Readings(Vec<SensorReading>),

    SetSetpoint {
        tank: TankId,
        value: f64,
        respond_to: oneshot::Sender<Result<(), ThermostatError>>,
    },

    GetProposals {
        respond_to: oneshot::Sender<Vec<HeatProposal>>,
    },
}

pub struct ThermostatActor {
    receiver: mpsc::Receiver<ThermostatCommand>,
    saturation_acks: mpsc::UnboundedReceiver<TankId>,
    tanks: BTreeMap<TankId, TankThermostat>,
    safety: SafetyHandle,
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
}

impl ThermostatActor {
    pub fn new(
        receiver: mpsc::Receiver<ThermostatCommand>,
        saturation_acks: mpsc::UnboundedReceiver<TankId>,
        safety: SafetyHandle,
        config: watch::Receiver<Arc<DaemonConfig>>,
        cancel_token: CancellationToken,
    ) -> Self {
        let tanks = build_tanks(&config.borrow(), BTreeMap::new());
        Self {
            receiver,
            saturation_acks,
            tanks,
            safety,
            config,
            cancel_token,
        }
    }

    pub async fn run(mut self) {
        info!(tanks = self.tanks.len(), "Thermostat starting");
        let mut config_open = true;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                Some(tank) = self.saturation_acks.recv() => {
                    let acknowledged = self
                        .tanks
                        .get_mut(&tank)
                        .is_some_and(TankThermostat::acknowledge_saturation);
                    if acknowledged && !self.propose().await {
                        break;
                    }
                }

                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let config = Arc::clone(&self.config.borrow_and_update());
                    let previous = std::mem::take(&mut self.tanks);
                    self.tanks = build_tanks(&config, previous);
                    info!(tanks = self.tanks.len(), "Thermostat settings reloaded");
                }
            }
        }

        debug!("Thermostat stopped");
    }

    /// Returns false once the safety monitor is gone.
    async fn handle_command(&mut self, cmd: ThermostatCommand) -> bool {
        match cmd {
            ThermostatCommand::Readings(readings) => {
                let now = Instant::now();
                for thermostat in self.tanks.values_mut() {
                    let sensor = thermostat.settings().sensor.clone();
                    let reading = readings.iter().find(|r| r.sensor_id() == &sensor);
                    if let Some((from, to)) = thermostat.update(reading, now) {
                        info!(
                            tank = %thermostat.settings().tank,
                            from = %from,
                            to = %to,
                            "Thermostat state changed"
                        );
                    }
                }
                self.propose().await
            }
            ThermostatCommand::SetSetpoint {
                tank,
                value,
                respond_to,
            } => {
                let result = match self.tanks.get_mut(&tank) {
                    Some(thermostat) => thermostat.set_setpoint(value),
                    None => Err(ThermostatError::UnknownTank(tank)),
                };
                let accepted = result.is_ok();
                let _ = respond_to.send(result);
                !accepted || self.propose().await
            }
            ThermostatCommand::GetProposals { respond_to } => {
                let _ = respond_to.send(self.proposals());
                true
            }
        }
    }

    fn proposals(&self) -> Vec<HeatProposal> {
        self.tanks.values().map(TankThermostat::proposal).collect()
    }

    async fn propose(&self) -> bool {
        if self.safety.propose_heat(self.proposals()).await.is_err() {
            warn!("Safety monitor gone, thermostat stopping");
            return false;
        }
        true
    }
}

/// Builds the tank map from config, carrying over the running state of
/// tanks that still exist.
fn build_tanks(
    config: &DaemonConfig,
    mut previous: BTreeMap<TankId, TankThermostat>,
) -> BTreeMap<TankId, TankThermostat> {
    config
        .tanks
        .iter()
        .filter_map(TankSettings::from_config)
        .map(|settings| {
            let tank = settings.tank.clone();
            let thermostat = match previous.remove(&tank) {
                Some(mut existing) => {
                    existing.apply_settings(settings);
                    existing
                }
                None => TankThermostat::new(settings),
            };
            (tank, thermostat)
        })
        .collect()
}
