//! Safety monitor using the actor pattern.
//!
//! The only component that changes circuit state or the alarm level.
//!
//! ```text
//! ┌────────────┐  SensorBatch   ┌───────────────┐  commanded (watch)  ┌────────────┐
//! │ SensorHub  │───────────────▶│               │────────────────────▶│ SensorHub  │
//! ├────────────┤  LinkReport    │               │  shutoffs (mpsc)    ├────────────┤
//! │ GFCI link  │───────────────▶│ SafetyActor   │────────────────────▶│ GFCI link  │
//! ├────────────┤  HeatProposals │               │  saturation acks    ├────────────┤
//! │ Thermostat │───────────────▶│               │────────────────────▶│ Thermostat │
//! └────────────┘                └───────────────┘                     └────────────┘
//!                                       │ StateEvent (broadcast)
//!                                       ▼
//!                                  IPC subscribers
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pvh_core::{CircuitId, CircuitState, TankId};

mod actor;
mod commands;
mod handle;
mod state;

pub use actor::SafetyActor;
pub use commands::{AckOutcome, CircuitMap, SafetyCommand, SafetyError};
pub use handle::SafetyHandle;
pub use state::{Outbox, SafetySettings, SafetyState, TankWiring};

use crate::config::DaemonConfig;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Receiving ends of the actor's outbound channels.
pub struct SafetyOutputs {
    /// Circuits to send SHUTOFF_CMD for, consumed by the GFCI link task.
    pub shutoffs: mpsc::UnboundedReceiver<CircuitId>,
    /// Acknowledged saturations, consumed by the thermostat.
    pub saturation_acks: mpsc::UnboundedReceiver<TankId>,
}

/// Spawns the safety actor.
///
/// Returns the handle, the outbound channel receivers and the actor's join
/// handle. The actor's result is the daemon's fate: an error means state
/// corruption was detected.
pub fn spawn_safety_monitor(
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> (
    SafetyHandle,
    SafetyOutputs,
    JoinHandle<Result<(), SafetyError>>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let initial: CircuitMap = CircuitId::ALL
        .iter()
        .map(|c| (*c, CircuitState::Off))
        .collect::<BTreeMap<_, _>>();
    let (commanded_tx, commanded_rx) = watch::channel(initial);
    let (shutoff_tx, shutoff_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    let actor = SafetyActor::new(
        cmd_rx,
        commanded_tx,
        event_tx.clone(),
        shutoff_tx,
        ack_tx,
        config,
        cancel_token,
    );
    let join = tokio::spawn(actor.run());

    (
        SafetyHandle::new(cmd_tx, event_tx, commanded_rx),
        SafetyOutputs {
            shutoffs: shutoff_rx,
            saturation_acks: ack_rx,
        },
        join,
    )
}
