//! Client interface for the safety actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `SafetyError::ChannelClosed`.

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use pvh_core::{
    AlarmEventId, CircuitId, FaultSide, LinkState, SensorId, SensorReading, StateEvent, Subsystem,
    SystemSnapshot,
};

use super::commands::{AckOutcome, CircuitMap, SafetyCommand, SafetyError};
use crate::sensor_hub::SensorBatch;
use crate::thermostat::HeatProposal;

// ============================================================================
// Safety Handle
// ============================================================================

/// Cheap-to-clone handle shared by every task that talks to the safety
/// monitor.
#[derive(Clone)]
pub struct SafetyHandle {
    sender: mpsc::Sender<SafetyCommand>,
    event_sender: broadcast::Sender<StateEvent>,
    commanded: watch::Receiver<CircuitMap>,
}

impl SafetyHandle {
    pub fn new(
        sender: mpsc::Sender<SafetyCommand>,
        event_sender: broadcast::Sender<StateEvent>,
        commanded: watch::Receiver<CircuitMap>,
    ) -> Self {
        Self {
            sender,
            event_sender,
            commanded,
        }
    }

    async fn send(&self, cmd: SafetyCommand) -> Result<(), SafetyError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SafetyError::ChannelClosed)
    }

    pub async fn sensor_batch(&self, batch: SensorBatch) -> Result<(), SafetyError> {
        self.send(SafetyCommand::SensorBatch(batch)).await
    }

    pub async fn report_link(&self, state: LinkState) -> Result<(), SafetyError> {
        self.send(SafetyCommand::LinkReport(state)).await
    }

    pub async fn fault_reported(
        &self,
        circuit: CircuitId,
        side: FaultSide,
    ) -> Result<(), SafetyError> {
        self.send(SafetyCommand::FaultReported { circuit, side })
            .await
    }

    pub async fn shutoff_confirmed(&self, circuit: CircuitId) -> Result<(), SafetyError> {
        self.send(SafetyCommand::ShutoffConfirmed { circuit }).await
    }

    pub async fn propose_heat(&self, proposals: Vec<HeatProposal>) -> Result<(), SafetyError> {
        self.send(SafetyCommand::HeatProposals(proposals)).await
    }

    pub async fn report_alive(&self, subsystem: Subsystem) -> Result<(), SafetyError> {
        self.send(SafetyCommand::Alive(subsystem)).await
    }

    /// Acknowledges an alarm.
    ///
    /// # Errors
    ///
    /// - `SafetyError::AlarmNotFound` if no such alarm exists
    /// - `SafetyError::ChannelClosed` if the actor has shut down
    pub async fn acknowledge_alarm(
        &self,
        event_id: AlarmEventId,
    ) -> Result<AckOutcome, SafetyError> {
        let (tx, rx) = oneshot::channel();
        self.send(SafetyCommand::AcknowledgeAlarm {
            event_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SafetyError::ChannelClosed)?
    }

    pub async fn snapshot(&self) -> Result<SystemSnapshot, SafetyError> {
        let (tx, rx) = oneshot::channel();
        self.send(SafetyCommand::GetSnapshot { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SafetyError::ChannelClosed)
    }

    pub async fn history(
        &self,
        sensor: SensorId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SensorReading>, SafetyError> {
        let (tx, rx) = oneshot::channel();
        self.send(SafetyCommand::GetHistory {
            sensor,
            from,
            to,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SafetyError::ChannelClosed)?
    }

    /// Subscribes to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.event_sender.subscribe()
    }

    /// Watches the commanded circuit states.
    pub fn commanded(&self) -> watch::Receiver<CircuitMap> {
        self.commanded.clone()
    }
}
