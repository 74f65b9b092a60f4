//! PVH Core - Shared domain types for the hot-water control daemon
//!
//! This crate provides the domain types and pure state machines shared
//! between the daemon (pvhd), the wire protocol and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod alarm;
pub mod calibration;
pub mod circuit;
pub mod error;
pub mod health;
pub mod link;
pub mod sensor;
pub mod tank;
pub mod view;

// Re-exports for convenience
pub use alarm::{AlarmCause, AlarmEvent, AlarmEventId, AlarmLevel};
pub use calibration::{CalibrationProfile, CalibrationSet, ValueRange};
pub use circuit::{CircuitId, CircuitState, FaultSide};
pub use error::{DomainError, DomainResult};
pub use health::{is_healthy, HealthRecord, HealthReport, Subsystem, SubsystemStatus};
pub use link::LinkState;
pub use sensor::{SensorId, SensorReading, StaleReason, Validity};
pub use tank::{TankId, ThermostatState};
pub use view::{CircuitView, StateEvent, SystemSnapshot, TankView};
