//! Safety monitor commands and errors.
//!
//! Commands fall into three groups, processed in this order within one
//! evaluation cycle:
//! - facts: sensor batches, link reports, fault reports, shutoff
//!   confirmations, liveness reports
//! - proposals: heat requests from the thermostat
//! - requests: acknowledgments and queries, answered after evaluation

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pvh_core::{
    AlarmEventId, CircuitId, CircuitState, FaultSide, LinkState, SensorId, SensorReading,
    Subsystem, SystemSnapshot,
};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::sensor_hub::SensorBatch;
use crate::thermostat::HeatProposal;

/// Commanded state of every circuit.
pub type CircuitMap = BTreeMap<CircuitId, CircuitState>;

// ============================================================================
// Safety Commands
// ============================================================================

#[derive(Debug)]
pub enum SafetyCommand {
    /// Readings of one sensor hub poll cycle.
    SensorBatch(SensorBatch),

    /// Current state of the GFCI bridge link, sent on every heartbeat tick.
    LinkReport(LinkState),

    /// A ground fault reported by the bridge.
    FaultReported { circuit: CircuitId, side: FaultSide },

    /// The bridge acknowledged a shutoff command.
    ShutoffConfirmed { circuit: CircuitId },

    /// Heat demand of every tank.
    HeatProposals(Vec<HeatProposal>),

    /// Liveness report of a subsystem without its own fact stream.
    Alive(Subsystem),

    /// Operator acknowledgment of an alarm.
    AcknowledgeAlarm {
        event_id: AlarmEventId,
        respond_to: oneshot::Sender<Result<AckOutcome, SafetyError>>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<SystemSnapshot>,
    },

    /// Retained readings of a sensor within an optional time window.
    GetHistory {
        sensor: SensorId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        respond_to: oneshot::Sender<Result<Vec<SensorReading>, SafetyError>>,
    },
}

/// Processing stage of a command within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Fact,
    Proposal,
    Request,
}

impl SafetyCommand {
    pub(crate) fn stage(&self) -> Stage {
        match self {
            Self::SensorBatch(_)
            | Self::LinkReport(_)
            | Self::FaultReported { .. }
            | Self::ShutoffConfirmed { .. }
            | Self::Alive(_) => Stage::Fact,
            Self::HeatProposals(_) => Stage::Proposal,
            Self::AcknowledgeAlarm { .. } | Self::GetSnapshot { .. } | Self::GetHistory { .. } => {
                Stage::Request
            }
        }
    }
}

/// Result of an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub event_id: AlarmEventId,
    /// The alarm was removed. False while its condition still holds.
    pub cleared: bool,
}

// ============================================================================
// Safety Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyError {
    #[error("Alarm {0} not found")]
    AlarmNotFound(AlarmEventId),

    #[error("Unknown sensor: {0}")]
    UnknownSensor(SensorId),

    /// A circuit was found energized in a state that forbids it. All
    /// circuits have been forced off and the daemon must stop.
    #[error("Safety invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Safety monitor channel closed")]
    ChannelClosed,
}
